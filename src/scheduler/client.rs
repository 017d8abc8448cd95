//! Outbound side of the scheduler peer protocol

use crate::common::{
    Error, HostInfo, InstanceInfo, Result, ResultExt, ScheduleInput, ScheduleItem,
    ScheduleOutput, ScheduleSpec,
};
use async_trait::async_trait;
use std::time::Duration;

/// Sends a placement request to the scheduler of another host
#[async_trait]
pub trait ScheduleForwarder: Send + Sync {
    async fn forward(&self, host: &HostInfo, item: &ScheduleItem) -> Result<InstanceInfo>;
}

#[derive(Clone)]
pub struct SchedulerClient {
    client: reqwest::Client,
}

impl SchedulerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building scheduler HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ScheduleForwarder for SchedulerClient {
    async fn forward(&self, host: &HostInfo, item: &ScheduleItem) -> Result<InstanceInfo> {
        let url = format!("http://{}/v1/schedule", host.address);
        let input = ScheduleInput {
            spec: ScheduleSpec {
                host_id: host.uuid.clone(),
            },
            item: item.clone(),
        };
        tracing::debug!("POST {}", url);

        let resp = self.client.post(&url).json(&input).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Http(format!("Bad response: {}: {}", status, body)));
        }
        let output: ScheduleOutput = resp.json().await.context("schedule failure")?;
        if output.instance.id.is_empty() {
            return Err(Error::InvalidInstance(
                "invalid response with empty instance ID".into(),
            ));
        }
        Ok(output.instance)
    }
}
