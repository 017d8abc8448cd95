//! Host placement for controller and replica instances
//!
//! The scheduler picks the host that runs an instance action. Actions for
//! the current host run through the local [`ScheduleOps`]; actions for other
//! hosts are forwarded to that host's scheduler endpoint, so every process
//! is created by the host that will own it.
//!
//! Candidate hosts are tried in host-id order. Hosts named by a soft
//! anti-affinity policy go last.

pub mod client;

pub use client::{ScheduleForwarder, SchedulerClient};

use crate::common::{
    Error, HostInfo, InstanceInfo, InstanceType, Result, ResultExt, ScheduleItem, SchedulePolicy,
    ScheduleSpec,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Host-local placement backend
#[async_trait]
pub trait ScheduleOps: Send + Sync {
    async fn list_hosts(&self) -> Result<BTreeMap<String, HostInfo>>;
    async fn get_host(&self, id: &str) -> Result<Option<HostInfo>>;
    fn current_host_id(&self) -> String;
    /// Execute a placement action on this host
    async fn process_schedule(&self, item: &ScheduleItem) -> Result<InstanceInfo>;
}

#[derive(Clone)]
pub struct Scheduler {
    ops: Arc<dyn ScheduleOps>,
    forwarder: Arc<dyn ScheduleForwarder>,
}

impl Scheduler {
    pub fn new(ops: Arc<dyn ScheduleOps>, forwarder: Arc<dyn ScheduleForwarder>) -> Self {
        Self { ops, forwarder }
    }

    pub fn current_host_id(&self) -> String {
        self.ops.current_host_id()
    }

    /// Place `item` on its pinned host, or on the first candidate that accepts it.
    pub async fn schedule(
        &self,
        item: &ScheduleItem,
        policy: Option<&SchedulePolicy>,
    ) -> Result<InstanceInfo> {
        if item.instance.id.is_empty() {
            return Err(Error::InvalidInstance(
                "instance ID required for scheduling".into(),
            ));
        }
        if !item.instance.host_id.is_empty() {
            let spec = ScheduleSpec {
                host_id: item.instance.host_id.clone(),
            };
            return self.schedule_process(&spec, item).await;
        }

        let hosts = self.ops.list_hosts().await.context("fail to schedule")?;
        for host_id in candidate_hosts(hosts.keys(), policy) {
            let spec = ScheduleSpec {
                host_id: host_id.clone(),
            };
            match self.schedule_process(&spec, item).await {
                Ok(instance) => return Ok(instance),
                Err(e) => tracing::warn!(
                    "Fail to schedule {} on host {}, trying on another one: {}",
                    item.instance.id,
                    host_id,
                    e
                ),
            }
        }
        Err(Error::NoSuitableHost)
    }

    /// Run `item` on `spec.host_id`, locally or through that host's scheduler.
    pub async fn schedule_process(
        &self,
        spec: &ScheduleSpec,
        item: &ScheduleItem,
    ) -> Result<InstanceInfo> {
        if self.ops.current_host_id() == spec.host_id {
            return self.process(spec, item).await;
        }

        let host = self
            .ops
            .get_host(&spec.host_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cannot find host {}", spec.host_id)))?;
        let instance = self
            .forwarder
            .forward(&host, item)
            .await
            .with_context(|| {
                format!(
                    "Fail to schedule on host {}({} {})",
                    host.uuid, host.name, host.address
                )
            })?;
        tracing::debug!("Scheduled {} to {}({})", item.instance.id, host.uuid, host.address);
        Ok(instance)
    }

    /// Execute `item` on this host. Rejects requests routed to the wrong host.
    pub async fn process(&self, spec: &ScheduleSpec, item: &ScheduleItem) -> Result<InstanceInfo> {
        let current = self.ops.current_host_id();
        if current != spec.host_id {
            return Err(Error::WrongHost {
                expected: spec.host_id.clone(),
                current,
            });
        }
        let instance = self
            .ops
            .process_schedule(item)
            .await
            .context("fail to process schedule request")?;
        if instance.id.is_empty() || instance.instance_type == InstanceType::Unknown {
            return Err(Error::InvalidInstance(format!(
                "missing key fields from schedule response {:?}",
                instance
            )));
        }
        Ok(instance)
    }
}

/// Hosts in id order, with the policy's hosts moved behind all others
fn candidate_hosts<'a>(
    hosts: impl Iterator<Item = &'a String>,
    policy: Option<&SchedulePolicy>,
) -> Vec<String> {
    let (low, mut normal): (Vec<String>, Vec<String>) = hosts
        .cloned()
        .partition(|id| policy.map(|p| p.host_ids.contains(id)).unwrap_or(false));
    normal.extend(low);
    normal
}
