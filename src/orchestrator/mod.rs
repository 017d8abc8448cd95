//! Backend that owns volume records and instance processes
//!
//! The manager never creates processes itself. It asks an [`Orchestrator`]
//! for controllers and replicas, and for the persisted volume records.
//! [`memory::MemoryOrchestrator`] keeps everything in a [`crate::common::Storage`].

pub mod memory;

pub use memory::{MemoryCluster, MemoryOrchestrator};

use crate::common::{ControllerInfo, HostInfo, ReplicaInfo, Result, SettingsInfo, VolumeInfo};
use async_trait::async_trait;
use std::collections::BTreeMap;

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Persist a new volume record. Fails if the name is taken.
    async fn create_volume(&self, volume: &VolumeInfo) -> Result<VolumeInfo>;
    async fn delete_volume(&self, name: &str) -> Result<()>;
    async fn get_volume(&self, name: &str) -> Result<Option<VolumeInfo>>;
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;
    async fn update_volume(&self, volume: &VolumeInfo) -> Result<()>;

    /// Start a controller on this host fronting `replicas`
    async fn create_controller(
        &self,
        volume_name: &str,
        replicas: &BTreeMap<String, ReplicaInfo>,
    ) -> Result<ControllerInfo>;
    /// Create a running replica and add it to the volume record
    async fn create_replica(&self, volume_name: &str) -> Result<ReplicaInfo>;

    async fn start_instance(&self, id: &str) -> Result<()>;
    async fn stop_instance(&self, id: &str) -> Result<()>;
    /// Destroy the instance and drop it from its volume record
    async fn remove_instance(&self, id: &str) -> Result<()>;

    /// Timestamp the replica with `replica.instance.address` as bad
    async fn mark_bad_replica(&self, volume_name: &str, replica: &ReplicaInfo) -> Result<()>;

    async fn list_hosts(&self) -> Result<BTreeMap<String, HostInfo>>;
    async fn get_host(&self, id: &str) -> Result<Option<HostInfo>>;
    fn current_host_id(&self) -> String;
    /// Manager endpoint address (`ip:port`) of a host
    async fn get_address(&self, host_id: &str) -> Result<String>;

    async fn get_settings(&self) -> Result<Option<SettingsInfo>>;
    async fn set_settings(&self, settings: &SettingsInfo) -> Result<()>;
}
