//! Store-backed orchestrator
//!
//! Every host runs a [`MemoryCluster`] over the same [`Storage`]. Instance
//! processes are records under `instances/`; controllers are backed by the
//! simulated engines when those are configured.

use crate::common::{
    ControllerInfo, Error, HostInfo, InstanceInfo, InstanceType, PolicyBinding, ReplicaInfo,
    Result, ResultExt, ScheduleAction, ScheduleData, ScheduleInstance, ScheduleItem,
    SchedulePolicy, SettingsInfo, Storage, VolumeInfo,
};
use crate::controller::sim::SimEngines;
use crate::orchestrator::Orchestrator;
use crate::scheduler::{ScheduleForwarder, ScheduleOps, Scheduler};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Value of [`ScheduleData::orchestrator`] this backend accepts
pub const ORCHESTRATOR_NAME: &str = "memory";

pub const CONTROLLER_PORT: u16 = 9501;
pub const REPLICA_PORT: u16 = 9502;

const HOSTS: &str = "hosts/";
const INSTANCES: &str = "instances/";
const VOLUMES: &str = "volumes/";
const SETTINGS: &str = "settings";

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryScheduleData {
    volume_name: String,
    #[serde(default)]
    volume_size: u64,
    #[serde(default)]
    engine_image: String,
    #[serde(default)]
    replica_addresses: Vec<String>,
}

/// Host-local half: executes placement actions on this host
pub struct MemoryCluster {
    host: HostInfo,
    store: Storage,
    engines: Option<Arc<SimEngines>>,
}

impl MemoryCluster {
    pub fn new(host: HostInfo, store: Storage, engines: Option<Arc<SimEngines>>) -> Self {
        Self {
            host,
            store,
            engines,
        }
    }

    /// Announce this host to the cluster
    pub fn register(&self) -> Result<()> {
        self.store
            .put_json(&format!("{}{}", HOSTS, self.host.uuid), &self.host)?;
        tracing::info!("Registered host {} at {}", self.host.uuid, self.host.address);
        Ok(())
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    fn instance(&self, id: &str) -> Result<Option<InstanceInfo>> {
        self.store.get_json(&format!("{}{}", INSTANCES, id))
    }

    fn put_instance(&self, instance: &InstanceInfo) -> Result<()> {
        self.store
            .put_json(&format!("{}{}", INSTANCES, instance.id), instance)
    }

    fn create_instance(
        &self,
        item: &ScheduleItem,
        data: &MemoryScheduleData,
    ) -> Result<InstanceInfo> {
        let id = &item.instance.id;
        if self.instance(id)?.is_some() {
            return Err(Error::InvalidInstance(format!(
                "instance {} already exists",
                id
            )));
        }
        let (instance_type, address) = match item.action {
            ScheduleAction::CreateController => (
                InstanceType::Controller,
                format!("http://{}:{}", id, CONTROLLER_PORT),
            ),
            _ => (
                InstanceType::Replica,
                format!("tcp://{}:{}", id, REPLICA_PORT),
            ),
        };
        let instance = InstanceInfo {
            id: id.clone(),
            host_id: self.host.uuid.clone(),
            instance_type,
            address,
            running: true,
            volume_name: item.instance.volume_name.clone(),
        };
        if instance_type == InstanceType::Controller {
            if let Some(engines) = &self.engines {
                engines.seed(
                    &instance.address,
                    &data.volume_name,
                    data.volume_size,
                    &data.replica_addresses,
                );
            }
        }
        self.put_instance(&instance)?;
        Ok(instance)
    }

    fn local_instance(&self, id: &str) -> Result<InstanceInfo> {
        let instance = self
            .instance(id)?
            .ok_or_else(|| Error::NotFound(format!("instance {}", id)))?;
        if instance.host_id != self.host.uuid {
            return Err(Error::WrongHost {
                expected: instance.host_id,
                current: self.host.uuid.clone(),
            });
        }
        Ok(instance)
    }

    fn shutdown_engine(&self, instance: &InstanceInfo) {
        if instance.instance_type == InstanceType::Controller {
            if let Some(engines) = &self.engines {
                engines.shutdown(&instance.address);
            }
        }
    }
}

#[async_trait]
impl ScheduleOps for MemoryCluster {
    async fn list_hosts(&self) -> Result<BTreeMap<String, HostInfo>> {
        Ok(self
            .store
            .list_json::<HostInfo>(HOSTS)?
            .into_iter()
            .map(|h| (h.uuid.clone(), h))
            .collect())
    }

    async fn get_host(&self, id: &str) -> Result<Option<HostInfo>> {
        self.store.get_json(&format!("{}{}", HOSTS, id))
    }

    fn current_host_id(&self) -> String {
        self.host.uuid.clone()
    }

    async fn process_schedule(&self, item: &ScheduleItem) -> Result<InstanceInfo> {
        if item.data.orchestrator != ORCHESTRATOR_NAME {
            return Err(Error::InvalidArgument(format!(
                "received request for the wrong orchestrator {}",
                item.data.orchestrator
            )));
        }
        let data: MemoryScheduleData = if item.data.data.is_null() {
            MemoryScheduleData::default()
        } else {
            serde_json::from_value(item.data.data.clone()).context("fail to parse schedule data")?
        };

        match item.action {
            ScheduleAction::CreateController | ScheduleAction::CreateReplica => {
                self.create_instance(item, &data)
            }
            ScheduleAction::Start | ScheduleAction::Stop => {
                let mut instance = self.local_instance(&item.instance.id)?;
                instance.running = item.action == ScheduleAction::Start;
                if !instance.running {
                    self.shutdown_engine(&instance);
                }
                self.put_instance(&instance)?;
                Ok(instance)
            }
            ScheduleAction::Delete => {
                let instance = self.local_instance(&item.instance.id)?;
                self.shutdown_engine(&instance);
                self.store
                    .delete(&format!("{}{}", INSTANCES, instance.id))?;
                Ok(instance)
            }
        }
    }
}

/// Cluster-wide half: volume records plus placement through the scheduler
pub struct MemoryOrchestrator {
    cluster: Arc<MemoryCluster>,
    scheduler: Scheduler,
    store: Storage,
    /// Guards read-modify-write of volume records
    records: Mutex<()>,
}

impl MemoryOrchestrator {
    pub fn new(cluster: Arc<MemoryCluster>, forwarder: Arc<dyn ScheduleForwarder>) -> Self {
        let store = cluster.store.clone();
        let scheduler = Scheduler::new(cluster.clone(), forwarder);
        Self {
            cluster,
            scheduler,
            store,
            records: Mutex::new(()),
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    fn volume_key(name: &str) -> String {
        format!("{}{}", VOLUMES, name)
    }

    fn load_volume(&self, name: &str) -> Result<Option<VolumeInfo>> {
        self.store.get_json(&Self::volume_key(name))
    }

    /// Update fields owned by the instance records
    fn refresh(&self, mut volume: VolumeInfo) -> Result<VolumeInfo> {
        for replica in volume.replicas.values_mut() {
            if let Some(instance) = self.cluster.instance(&replica.instance.id)? {
                replica.instance = instance;
            }
        }
        if let Some(ctrl) = &volume.controller {
            match self.cluster.instance(&ctrl.instance.id)? {
                Some(instance) => volume.controller = Some(ControllerInfo { instance }),
                None => volume.controller = None,
            }
        }
        Ok(volume)
    }

    fn modify_volume<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut VolumeInfo),
    {
        let _guard = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut volume = self
            .load_volume(name)?
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", name)))?;
        f(&mut volume);
        self.store.put_json(&Self::volume_key(name), &volume)
    }

    fn schedule_item(
        action: ScheduleAction,
        instance: &InstanceInfo,
        data: serde_json::Value,
    ) -> ScheduleItem {
        ScheduleItem {
            action,
            instance: ScheduleInstance {
                id: instance.id.clone(),
                host_id: instance.host_id.clone(),
                instance_type: instance.instance_type,
                volume_name: instance.volume_name.clone(),
            },
            data: ScheduleData {
                orchestrator: ORCHESTRATOR_NAME.to_string(),
                data,
            },
        }
    }

    async fn act_on_instance(&self, action: ScheduleAction, id: &str) -> Result<InstanceInfo> {
        let instance = self
            .cluster
            .instance(id)?
            .ok_or_else(|| Error::NotFound(format!("instance {}", id)))?;
        let item = Self::schedule_item(action, &instance, serde_json::Value::Null);
        self.scheduler.schedule(&item, None).await
    }

    async fn settings(&self) -> Result<SettingsInfo> {
        Ok(self.get_settings().await?.unwrap_or_default())
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn create_volume(&self, volume: &VolumeInfo) -> Result<VolumeInfo> {
        let _guard = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if self.load_volume(&volume.name)?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "volume {} already exists",
                volume.name
            )));
        }
        let mut record = volume.clone();
        record.state = None;
        record.endpoint = None;
        if record.created.is_none() {
            record.created = Some(Utc::now());
        }
        self.store.put_json(&Self::volume_key(&record.name), &record)?;
        Ok(record)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let _guard = self.records.lock().unwrap_or_else(|e| e.into_inner());
        self.store.delete(&Self::volume_key(name))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<VolumeInfo>> {
        match self.load_volume(name)? {
            Some(volume) => Ok(Some(self.refresh(volume)?)),
            None => Ok(None),
        }
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.store
            .list_json::<VolumeInfo>(VOLUMES)?
            .into_iter()
            .map(|v| self.refresh(v))
            .collect()
    }

    async fn update_volume(&self, volume: &VolumeInfo) -> Result<()> {
        let _guard = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if self.load_volume(&volume.name)?.is_none() {
            return Err(Error::NotFound(format!(
                "cannot update volume {} because it doesn't exist",
                volume.name
            )));
        }
        let mut record = volume.clone();
        record.state = None;
        record.endpoint = None;
        self.store.put_json(&Self::volume_key(&record.name), &record)
    }

    async fn create_controller(
        &self,
        volume_name: &str,
        replicas: &BTreeMap<String, ReplicaInfo>,
    ) -> Result<ControllerInfo> {
        let volume = self
            .load_volume(volume_name)?
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", volume_name)))?;
        let settings = self.settings().await?;
        let data = MemoryScheduleData {
            volume_name: volume_name.to_string(),
            volume_size: volume.size,
            engine_image: settings.engine_image,
            replica_addresses: replicas
                .values()
                .map(|r| r.instance.address.clone())
                .collect(),
        };

        let mut target = InstanceInfo::new(
            format!("{}-controller-{}", volume_name, crate::common::random_id()),
            InstanceType::Controller,
        );
        target.host_id = self.cluster.current_host_id();
        target.volume_name = volume_name.to_string();
        let item = Self::schedule_item(
            ScheduleAction::CreateController,
            &target,
            serde_json::to_value(&data)?,
        );
        let instance = self
            .scheduler
            .schedule(&item, None)
            .await
            .with_context(|| format!("Fail to create controller for {}", volume_name))?;
        Ok(ControllerInfo { instance })
    }

    async fn create_replica(&self, volume_name: &str) -> Result<ReplicaInfo> {
        let volume = self
            .load_volume(volume_name)?
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", volume_name)))?;
        let settings = self.settings().await?;
        let volume = self.refresh(volume)?;

        let policy = SchedulePolicy {
            binding: PolicyBinding::SoftAntiAffinity,
            host_ids: volume
                .replicas
                .values()
                .filter(|r| !r.is_bad() && !r.instance.host_id.is_empty())
                .map(|r| r.instance.host_id.clone())
                .collect(),
        };
        let name = format!("{}-replica-{}", volume_name, crate::common::random_id());
        let mut target = InstanceInfo::new(name.clone(), InstanceType::Replica);
        target.volume_name = volume_name.to_string();
        let data = MemoryScheduleData {
            volume_name: volume_name.to_string(),
            volume_size: volume.size,
            engine_image: settings.engine_image,
            replica_addresses: Vec::new(),
        };
        let item = Self::schedule_item(
            ScheduleAction::CreateReplica,
            &target,
            serde_json::to_value(&data)?,
        );
        let instance = self
            .scheduler
            .schedule(&item, Some(&policy))
            .await
            .with_context(|| format!("Fail to create replica for {}", volume_name))?;

        let replica = ReplicaInfo {
            instance,
            name: name.clone(),
            mode: None,
            bad_timestamp: None,
        };
        let record = replica.clone();
        self.modify_volume(volume_name, move |v| {
            v.replicas.insert(name, record);
        })?;
        Ok(replica)
    }

    async fn start_instance(&self, id: &str) -> Result<()> {
        self.act_on_instance(ScheduleAction::Start, id)
            .await
            .with_context(|| format!("failed to start instance {}", id))?;
        Ok(())
    }

    async fn stop_instance(&self, id: &str) -> Result<()> {
        self.act_on_instance(ScheduleAction::Stop, id)
            .await
            .with_context(|| format!("failed to stop instance {}", id))?;
        Ok(())
    }

    async fn remove_instance(&self, id: &str) -> Result<()> {
        let instance = match self.cluster.instance(id)? {
            Some(instance) => instance,
            None => {
                tracing::debug!("Instance {} already removed", id);
                return Ok(());
            }
        };
        self.act_on_instance(ScheduleAction::Delete, id)
            .await
            .with_context(|| format!("failed to remove instance {}", id))?;

        let volume_name = instance.volume_name.clone();
        if volume_name.is_empty() || self.load_volume(&volume_name)?.is_none() {
            return Ok(());
        }
        self.modify_volume(&volume_name, |v| match instance.instance_type {
            InstanceType::Controller => {
                if v.controller.as_ref().map(|c| c.instance.id == id) == Some(true) {
                    v.controller = None;
                }
            }
            _ => v.replicas.retain(|_, r| r.instance.id != id),
        })
    }

    async fn mark_bad_replica(&self, volume_name: &str, replica: &ReplicaInfo) -> Result<()> {
        let mut found = false;
        self.modify_volume(volume_name, |v| {
            for r in v.replicas.values_mut() {
                if r.instance.address == replica.instance.address {
                    found = true;
                    if r.bad_timestamp.is_none() {
                        r.bad_timestamp = Some(Utc::now());
                    }
                }
            }
        })?;
        if !found {
            return Err(Error::NotFound(format!(
                "replica with address {} in volume '{}'",
                replica.instance.address, volume_name
            )));
        }
        Ok(())
    }

    async fn list_hosts(&self) -> Result<BTreeMap<String, HostInfo>> {
        self.cluster.list_hosts().await
    }

    async fn get_host(&self, id: &str) -> Result<Option<HostInfo>> {
        self.cluster.get_host(id).await
    }

    fn current_host_id(&self) -> String {
        self.cluster.current_host_id()
    }

    async fn get_address(&self, host_id: &str) -> Result<String> {
        self.get_host(host_id)
            .await?
            .map(|h| h.address)
            .ok_or_else(|| Error::NotFound(format!("host {}", host_id)))
    }

    async fn get_settings(&self) -> Result<Option<SettingsInfo>> {
        self.store.get_json(SETTINGS)
    }

    async fn set_settings(&self, settings: &SettingsInfo) -> Result<()> {
        self.store.put_json(SETTINGS, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Routes forwarded requests straight to the other host's cluster
    struct Loopback {
        clusters: HashMap<String, Arc<MemoryCluster>>,
    }

    #[async_trait]
    impl ScheduleForwarder for Loopback {
        async fn forward(&self, host: &HostInfo, item: &ScheduleItem) -> Result<InstanceInfo> {
            let cluster = self
                .clusters
                .get(&host.uuid)
                .ok_or_else(|| Error::ConnectionFailed(host.address.clone()))?;
            cluster.process_schedule(item).await
        }
    }

    fn host(id: &str) -> HostInfo {
        HostInfo {
            uuid: id.to_string(),
            name: format!("node-{}", id),
            address: format!("{}:9500", id),
        }
    }

    fn two_hosts() -> (MemoryOrchestrator, Arc<SimEngines>) {
        let store = Storage::new_memory();
        let engines = Arc::new(SimEngines::new());
        let mut clusters = HashMap::new();
        for id in ["host-a", "host-b"] {
            let cluster = Arc::new(MemoryCluster::new(
                host(id),
                store.clone(),
                Some(engines.clone()),
            ));
            cluster.register().unwrap();
            clusters.insert(id.to_string(), cluster);
        }
        let local = clusters["host-a"].clone();
        (
            MemoryOrchestrator::new(local, Arc::new(Loopback { clusters })),
            engines,
        )
    }

    #[tokio::test]
    async fn test_wrong_orchestrator() {
        let cluster = MemoryCluster::new(host("host-a"), Storage::new_memory(), None);
        let item = ScheduleItem {
            action: ScheduleAction::CreateReplica,
            instance: ScheduleInstance {
                id: "r1".into(),
                host_id: "host-a".into(),
                instance_type: InstanceType::Replica,
                volume_name: "v1".into(),
            },
            data: ScheduleData {
                orchestrator: "docker".into(),
                data: serde_json::Value::Null,
            },
        };
        assert!(matches!(
            cluster.process_schedule(&item).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_replicas_spread_across_hosts() {
        let (orc, _) = two_hosts();
        orc.create_volume(&VolumeInfo::new("v1", 4096, 2))
            .await
            .unwrap();

        let r1 = orc.create_replica("v1").await.unwrap();
        let r2 = orc.create_replica("v1").await.unwrap();
        assert_eq!(r1.instance.host_id, "host-a");
        assert_eq!(r2.instance.host_id, "host-b");
        assert!(r1.instance.running);

        let volume = orc.get_volume("v1").await.unwrap().unwrap();
        assert_eq!(volume.replicas.len(), 2);
        assert!(volume.created.is_some());
    }

    #[tokio::test]
    async fn test_stop_start_remove_remote_instance() {
        let (orc, _) = two_hosts();
        orc.create_volume(&VolumeInfo::new("v1", 4096, 2))
            .await
            .unwrap();
        orc.create_replica("v1").await.unwrap();
        let remote = orc.create_replica("v1").await.unwrap();

        orc.stop_instance(&remote.instance.id).await.unwrap();
        let volume = orc.get_volume("v1").await.unwrap().unwrap();
        assert!(!volume.replicas[&remote.name].instance.running);

        orc.start_instance(&remote.instance.id).await.unwrap();
        orc.remove_instance(&remote.instance.id).await.unwrap();
        let volume = orc.get_volume("v1").await.unwrap().unwrap();
        assert_eq!(volume.replicas.len(), 1);

        // removing twice is harmless
        orc.remove_instance(&remote.instance.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_controller_seeds_engine() {
        let (orc, engines) = two_hosts();
        orc.create_volume(&VolumeInfo::new("v1", 4096, 1))
            .await
            .unwrap();
        let replica = orc.create_replica("v1").await.unwrap();
        let replicas: BTreeMap<String, ReplicaInfo> =
            [(replica.name.clone(), replica.clone())].into_iter().collect();

        let ctrl = orc.create_controller("v1", &replicas).await.unwrap();
        assert_eq!(ctrl.instance.host_id, "host-a");
        let engine = engines.get(&ctrl.instance.address).unwrap();
        assert_eq!(engine.replica_modes().len(), 1);

        orc.remove_instance(&ctrl.instance.id).await.unwrap();
        assert!(orc.get_volume("v1").await.unwrap().unwrap().controller.is_none());
    }

    #[tokio::test]
    async fn test_mark_bad_replica() {
        let (orc, _) = two_hosts();
        orc.create_volume(&VolumeInfo::new("v1", 4096, 1))
            .await
            .unwrap();
        let replica = orc.create_replica("v1").await.unwrap();

        orc.mark_bad_replica("v1", &replica).await.unwrap();
        let volume = orc.get_volume("v1").await.unwrap().unwrap();
        assert!(volume.replicas[&replica.name].is_bad());

        let stranger = ReplicaInfo::observed("tcp://nowhere:9502", crate::common::ReplicaMode::ERR);
        assert!(orc.mark_bad_replica("v1", &stranger).await.is_err());
    }
}
