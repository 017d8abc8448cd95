//! Shared data model: volumes, instances, placement requests, settings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_NUMBER_OF_REPLICAS: usize = 2;
pub const DEFAULT_STALE_REPLICA_TIMEOUT: Duration = Duration::from_secs(16 * 24 * 3600);

/// Derived health of a volume. Never stored authoritatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Detached,
    Faulted,
    Healthy,
    Degraded,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeState::Detached => write!(f, "detached"),
            VolumeState::Faulted => write!(f, "faulted"),
            VolumeState::Healthy => write!(f, "healthy"),
            VolumeState::Degraded => write!(f, "degraded"),
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMode {
    RW,
    WO,
    ERR,
}

impl ReplicaMode {
    /// Unknown tokens map to ERR.
    pub fn from_token(token: &str) -> Self {
        match token {
            "RW" => ReplicaMode::RW,
            "WO" => ReplicaMode::WO,
            _ => ReplicaMode::ERR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Controller,
    Replica,
    #[serde(other)]
    Unknown,
}

/// A controller or replica process as tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    #[serde(default)]
    pub host_id: String,
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub volume_name: String,
}

impl InstanceInfo {
    pub fn new(id: impl Into<String>, instance_type: InstanceType) -> Self {
        Self {
            id: id.into(),
            host_id: String::new(),
            instance_type,
            address: String::new(),
            running: false,
            volume_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerInfo {
    #[serde(flatten)]
    pub instance: InstanceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    #[serde(flatten)]
    pub instance: InstanceInfo,
    #[serde(default)]
    pub name: String,
    pub mode: Option<ReplicaMode>,
    pub bad_timestamp: Option<DateTime<Utc>>,
}

impl ReplicaInfo {
    /// A replica observed through the controller: only address and mode are known.
    pub fn observed(address: impl Into<String>, mode: ReplicaMode) -> Self {
        let mut instance = InstanceInfo::new("", InstanceType::Replica);
        instance.address = address.into();
        Self {
            instance,
            name: String::new(),
            mode: Some(mode),
            bad_timestamp: None,
        }
    }

    pub fn is_bad(&self) -> bool {
        self.bad_timestamp.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTask {
    Snapshot,
    Backup,
}

/// A cron-driven snapshot or backup schedule attached to a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringJob {
    pub name: String,
    pub task: JobTask,
    /// Six-field cron expression (with seconds), evaluated in UTC.
    pub cron: String,
    #[serde(default)]
    pub retain: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub size: u64,
    pub number_of_replicas: usize,
    #[serde(with = "duration_secs")]
    pub stale_replica_timeout: Duration,
    pub controller: Option<ControllerInfo>,
    #[serde(default)]
    pub replicas: BTreeMap<String, ReplicaInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<VolumeState>,
    #[serde(default)]
    pub recurring_jobs: Vec<RecurringJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_backup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

impl VolumeInfo {
    pub fn new(name: impl Into<String>, size: u64, number_of_replicas: usize) -> Self {
        Self {
            name: name.into(),
            size,
            number_of_replicas,
            stale_replica_timeout: DEFAULT_STALE_REPLICA_TIMEOUT,
            controller: None,
            replicas: BTreeMap::new(),
            state: None,
            recurring_jobs: Vec::new(),
            from_backup: None,
            endpoint: None,
            created: None,
        }
    }

    pub fn good_replica_count(&self) -> usize {
        self.replicas.values().filter(|r| !r.is_bad()).count()
    }

    /// Health derivation: a pure function of controller presence and the
    /// good-replica count.
    pub fn derive_state(&self) -> VolumeState {
        let good = self.good_replica_count();
        if good == 0 {
            VolumeState::Faulted
        } else if self.controller.is_none() {
            VolumeState::Detached
        } else if good == self.number_of_replicas {
            VolumeState::Healthy
        } else {
            VolumeState::Degraded
        }
    }

    pub fn is_attached(&self) -> bool {
        self.controller
            .as_ref()
            .map(|c| c.instance.running)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub uuid: String,
    pub name: String,
    /// `ip:port` of the host's manager endpoint.
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsInfo {
    #[serde(default)]
    pub backup_target: String,
    #[serde(default)]
    pub engine_image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub user_created: bool,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub snapshot_name: String,
    #[serde(default)]
    pub snapshot_created: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub volume_name: String,
    #[serde(default)]
    pub volume_size: u64,
}

// === Background tasks ===

/// Retention applied after a backup created by a recurring job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRetention {
    pub job: String,
    pub retain: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupBgTask {
    pub snapshot: String,
    pub backup_target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<BackupRetention>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BgTaskKind {
    Backup(BackupBgTask),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgTask {
    /// Sequence number assigned by the queue, starting at 1.
    pub num: u64,
    pub submitted: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub task: BgTaskKind,
}

impl BgTask {
    pub fn new(task: BgTaskKind) -> Self {
        Self {
            num: 0,
            submitted: None,
            started: None,
            finished: None,
            error: None,
            task,
        }
    }
}

// === Placement ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleAction {
    CreateController,
    CreateReplica,
    Start,
    Stop,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInstance {
    pub id: String,
    #[serde(default)]
    pub host_id: String,
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    #[serde(default)]
    pub volume_name: String,
}

/// Orchestrator-specific payload, opaque to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleData {
    pub orchestrator: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleItem {
    pub action: ScheduleAction,
    pub instance: ScheduleInstance,
    #[serde(default)]
    pub data: ScheduleData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub host_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyBinding {
    SoftAntiAffinity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePolicy {
    pub binding: PolicyBinding,
    /// Hosts already running a member of the affinity group.
    pub host_ids: BTreeSet<String>,
}

/// Body of a forwarded placement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleInput {
    pub spec: ScheduleSpec,
    pub item: ScheduleItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleOutput {
    pub instance: InstanceInfo,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(name: &str, bad: bool) -> ReplicaInfo {
        let mut instance = InstanceInfo::new(name, InstanceType::Replica);
        instance.address = format!("tcp://{}:9502", name);
        ReplicaInfo {
            instance,
            name: name.to_string(),
            mode: None,
            bad_timestamp: if bad { Some(Utc::now()) } else { None },
        }
    }

    fn volume(replicas: &[(&str, bool)], attached: bool) -> VolumeInfo {
        let mut v = VolumeInfo::new("v1", 1 << 30, 2);
        for (name, bad) in replicas {
            v.replicas.insert(name.to_string(), replica(name, *bad));
        }
        if attached {
            let mut instance = InstanceInfo::new("v1-controller", InstanceType::Controller);
            instance.running = true;
            v.controller = Some(ControllerInfo { instance });
        }
        v
    }

    #[test]
    fn test_state_faulted_wins() {
        assert_eq!(volume(&[], true).derive_state(), VolumeState::Faulted);
        assert_eq!(volume(&[], false).derive_state(), VolumeState::Faulted);
        assert_eq!(
            volume(&[("a", true), ("b", true)], true).derive_state(),
            VolumeState::Faulted
        );
    }

    #[test]
    fn test_state_detached() {
        assert_eq!(
            volume(&[("a", false), ("b", false)], false).derive_state(),
            VolumeState::Detached
        );
        assert_eq!(
            volume(&[("a", false), ("b", true)], false).derive_state(),
            VolumeState::Detached
        );
    }

    #[test]
    fn test_state_healthy_and_degraded() {
        assert_eq!(
            volume(&[("a", false), ("b", false)], true).derive_state(),
            VolumeState::Healthy
        );
        assert_eq!(
            volume(&[("a", false), ("b", true)], true).derive_state(),
            VolumeState::Degraded
        );
        assert_eq!(
            volume(&[("a", false), ("b", false), ("c", false)], true).derive_state(),
            VolumeState::Degraded
        );
    }

    #[test]
    fn test_unknown_instance_type() {
        let info: InstanceInfo =
            serde_json::from_str(r#"{"id":"x","type":"sidecar"}"#).unwrap();
        assert_eq!(info.instance_type, InstanceType::Unknown);
        assert!(!info.running);
    }

    #[test]
    fn test_bg_task_tagged() {
        let task = BgTask::new(BgTaskKind::Backup(BackupBgTask {
            snapshot: "snap-1".into(),
            backup_target: "s3://bucket".into(),
            retention: None,
        }));
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"]["type"], "backup");
        assert_eq!(json["task"]["snapshot"], "snap-1");
    }
}
