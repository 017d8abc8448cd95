//! Client for a volume's control endpoint
//!
//! The controller process of an attached volume exposes a small HTTP API.
//! [`EngineClient`] is the seam the rest of the crate talks to; [`HttpEngine`]
//! is the reqwest implementation.

use crate::common::{BackupInfo, Error, Result, ResultExt, SnapshotInfo};
use crate::controller::status::{parse_status_listing, ReplicaStatus};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Frontend information of a running volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub name: String,
    #[serde(default)]
    pub replica_count: usize,
    #[serde(default)]
    pub endpoint: String,
}

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Raw replica listing, before classification
    async fn replica_listing(&self) -> Result<Vec<ReplicaStatus>>;
    async fn add_replica(&self, address: &str) -> Result<()>;
    async fn remove_replica(&self, address: &str) -> Result<()>;
    async fn info(&self) -> Result<EngineInfo>;

    /// Returns the name of the created snapshot
    async fn snapshot_create(&self, name: &str, labels: &BTreeMap<String, String>)
        -> Result<String>;
    async fn snapshot_list(&self) -> Result<BTreeMap<String, SnapshotInfo>>;
    async fn snapshot_delete(&self, name: &str) -> Result<()>;
    async fn snapshot_revert(&self, name: &str) -> Result<()>;
    async fn snapshot_purge(&self) -> Result<()>;

    /// Returns the URL of the created backup
    async fn backup_create(&self, snapshot: &str, target: &str) -> Result<String>;
    async fn backup_restore(&self, url: &str) -> Result<()>;
    async fn backup_delete(&self, url: &str) -> Result<()>;
    async fn backup_list(&self, target: &str, volume: &str) -> Result<Vec<BackupInfo>>;
}

/// Opens engine clients by endpoint URL
pub trait EngineConnector: Send + Sync {
    fn connect(&self, url: &str) -> Arc<dyn EngineClient>;
}

/// Backup lookups that do not need a running volume
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn get_backup(&self, target: &str, url: &str) -> Result<Option<BackupInfo>>;
}

pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEngine {
    pub fn new(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .client
            .get(self.endpoint(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: serde_json::Value) -> Result<T> {
        let resp = self
            .client
            .post(self.endpoint(path))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        self.client
            .post(self.endpoint(path))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct NameResponse {
    name: String,
}

#[derive(Deserialize)]
struct UrlResponse {
    url: String,
}

#[async_trait]
impl EngineClient for HttpEngine {
    async fn replica_listing(&self) -> Result<Vec<ReplicaStatus>> {
        let body = self
            .client
            .get(self.endpoint("/v1/replicas"))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        if body.trim_start().starts_with('[') {
            Ok(serde_json::from_str(&body)?)
        } else {
            parse_status_listing(&body)
        }
    }

    async fn add_replica(&self, address: &str) -> Result<()> {
        self.post("/v1/replicas/add", json!({ "address": address }))
            .await
    }

    async fn remove_replica(&self, address: &str) -> Result<()> {
        self.post("/v1/replicas/remove", json!({ "address": address }))
            .await
    }

    async fn info(&self) -> Result<EngineInfo> {
        self.get_json("/v1/info").await
    }

    async fn snapshot_create(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        let resp: NameResponse = self
            .post_json(
                "/v1/snapshots/create",
                json!({ "name": name, "labels": labels }),
            )
            .await?;
        Ok(resp.name)
    }

    async fn snapshot_list(&self) -> Result<BTreeMap<String, SnapshotInfo>> {
        self.get_json("/v1/snapshots").await
    }

    async fn snapshot_delete(&self, name: &str) -> Result<()> {
        self.post("/v1/snapshots/delete", json!({ "name": name }))
            .await
    }

    async fn snapshot_revert(&self, name: &str) -> Result<()> {
        self.post("/v1/snapshots/revert", json!({ "name": name }))
            .await
    }

    async fn snapshot_purge(&self) -> Result<()> {
        self.post("/v1/snapshots/purge", json!({})).await
    }

    async fn backup_create(&self, snapshot: &str, target: &str) -> Result<String> {
        let resp: UrlResponse = self
            .post_json(
                "/v1/backups/create",
                json!({ "snapshot": snapshot, "target": target }),
            )
            .await?;
        Ok(resp.url)
    }

    async fn backup_restore(&self, url: &str) -> Result<()> {
        self.post("/v1/backups/restore", json!({ "url": url })).await
    }

    async fn backup_delete(&self, url: &str) -> Result<()> {
        self.post("/v1/backups/delete", json!({ "url": url })).await
    }

    async fn backup_list(&self, target: &str, volume: &str) -> Result<Vec<BackupInfo>> {
        let resp = self
            .client
            .get(self.endpoint("/v1/backups"))
            .query(&[("target", target), ("volume", volume)])
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

/// Connector handing out [`HttpEngine`]s that share one connection pool
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building engine HTTP client")?;
        Ok(Self { client })
    }
}

impl EngineConnector for HttpConnector {
    fn connect(&self, url: &str) -> Arc<dyn EngineClient> {
        Arc::new(HttpEngine::new(self.client.clone(), url))
    }
}

/// Backup lookups served by a standalone backup service
pub struct HttpBackupStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackupStore {
    pub fn new(connector: &HttpConnector, url: &str) -> Self {
        Self {
            client: connector.client.clone(),
            base_url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BackupStore for HttpBackupStore {
    async fn get_backup(&self, target: &str, url: &str) -> Result<Option<BackupInfo>> {
        let resp = self
            .client
            .get(format!("{}/v1/backups/inspect", self.base_url))
            .query(&[("target", target), ("url", url)])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let backup: BackupInfo = resp.error_for_status()?.json().await?;
        if backup.url.is_empty() {
            return Err(Error::Http(format!("backup service returned no URL for {}", url)));
        }
        Ok(Some(backup))
    }
}
