//! In-process engine simulator
//!
//! Stands in for real controller processes when the manager runs with the
//! memory orchestrator, and backs the test suite. Each simulated engine keeps
//! its replica modes, a snapshot chain and the snapshots themselves; backups
//! live in one registry shared by all engines.

use crate::common::{
    format_time_z, random_id, BackupInfo, Error, ReplicaMode, Result, SnapshotInfo,
};
use crate::controller::engine::{BackupStore, EngineClient, EngineConnector, EngineInfo};
use crate::controller::status::ReplicaStatus;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Name under which the engine reports the live head in snapshot listings
pub const VOLUME_HEAD: &str = "volume-head";

type BackupRegistry = Arc<Mutex<BTreeMap<String, BackupInfo>>>;

struct SimState {
    replicas: BTreeMap<String, ReplicaMode>,
    /// Head first, then snapshots newest to oldest
    chain: Vec<String>,
    head_seq: u64,
    snapshots: BTreeMap<String, SnapshotInfo>,
    unreachable: bool,
    restored: Vec<String>,
    purge_delay: Duration,
}

pub struct SimEngine {
    name: String,
    size: u64,
    state: Mutex<SimState>,
    backups: BackupRegistry,
    purges: AtomicUsize,
}

fn head_name(seq: u64) -> String {
    format!("volume-head-{:03}.img", seq)
}

impl SimEngine {
    fn new(name: &str, size: u64, backups: BackupRegistry) -> Self {
        Self {
            name: name.to_string(),
            size,
            state: Mutex::new(SimState {
                replicas: BTreeMap::new(),
                chain: vec![head_name(0)],
                head_seq: 0,
                snapshots: BTreeMap::new(),
                unreachable: false,
                restored: Vec::new(),
                purge_delay: Duration::ZERO,
            }),
            backups,
            purges: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reachable(&self) -> Result<MutexGuard<'_, SimState>> {
        let state = self.lock();
        if state.unreachable {
            return Err(Error::ConnectionFailed(format!(
                "engine for volume '{}' is unreachable",
                self.name
            )));
        }
        Ok(state)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_mode(&self, address: &str, mode: ReplicaMode) {
        self.lock().replicas.insert(address.to_string(), mode);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn set_purge_delay(&self, delay: Duration) {
        self.lock().purge_delay = delay;
    }

    pub fn replica_modes(&self) -> BTreeMap<String, ReplicaMode> {
        self.lock().replicas.clone()
    }

    pub fn purge_count(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }

    /// Backup URLs restored into this engine, oldest first
    pub fn restored(&self) -> Vec<String> {
        self.lock().restored.clone()
    }
}

#[async_trait]
impl EngineClient for SimEngine {
    async fn replica_listing(&self) -> Result<Vec<ReplicaStatus>> {
        let state = self.reachable()?;
        Ok(state
            .replicas
            .iter()
            .map(|(address, mode)| ReplicaStatus {
                address: address.clone(),
                mode: format!("{:?}", mode),
                chain: match mode {
                    ReplicaMode::ERR => Vec::new(),
                    _ => state.chain.clone(),
                },
            })
            .collect())
    }

    async fn add_replica(&self, address: &str) -> Result<()> {
        let mut state = self.reachable()?;
        if state.replicas.contains_key(address) {
            return Err(Error::InvalidArgument(format!(
                "replica {} already added",
                address
            )));
        }
        // rebuild is instantaneous here
        state.replicas.insert(address.to_string(), ReplicaMode::RW);
        Ok(())
    }

    async fn remove_replica(&self, address: &str) -> Result<()> {
        let mut state = self.reachable()?;
        match state.replicas.remove(address) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("replica {}", address))),
        }
    }

    async fn info(&self) -> Result<EngineInfo> {
        let state = self.reachable()?;
        Ok(EngineInfo {
            name: self.name.clone(),
            replica_count: state.replicas.len(),
            endpoint: format!("/dev/blockorc/{}", self.name),
        })
    }

    async fn snapshot_create(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut state = self.reachable()?;
        let name = if name.is_empty() {
            random_id()
        } else {
            name.to_string()
        };
        if state.snapshots.contains_key(&name) {
            return Err(Error::InvalidArgument(format!(
                "snapshot '{}' already exists",
                name
            )));
        }
        let parent = state.chain.get(1).cloned().unwrap_or_default();
        if let Some(p) = state.snapshots.get_mut(&parent) {
            p.children.push(name.clone());
        }
        state.snapshots.insert(
            name.clone(),
            SnapshotInfo {
                name: name.clone(),
                parent,
                children: Vec::new(),
                removed: false,
                user_created: true,
                created: format_time_z(Utc::now()),
                size: "0".to_string(),
                labels: labels.clone(),
            },
        );
        state.head_seq += 1;
        let head = head_name(state.head_seq);
        state.chain[0] = name.clone();
        state.chain.insert(0, head);
        Ok(name)
    }

    async fn snapshot_list(&self) -> Result<BTreeMap<String, SnapshotInfo>> {
        let state = self.reachable()?;
        let mut listing = state.snapshots.clone();
        listing.insert(
            VOLUME_HEAD.to_string(),
            SnapshotInfo {
                name: VOLUME_HEAD.to_string(),
                parent: state.chain.get(1).cloned().unwrap_or_default(),
                ..Default::default()
            },
        );
        Ok(listing)
    }

    async fn snapshot_delete(&self, name: &str) -> Result<()> {
        let mut state = self.reachable()?;
        match state.snapshots.get_mut(name) {
            Some(snap) => {
                snap.removed = true;
                Ok(())
            }
            None => Err(Error::NotFound(format!("snapshot '{}'", name))),
        }
    }

    async fn snapshot_revert(&self, name: &str) -> Result<()> {
        let mut state = self.reachable()?;
        match state.snapshots.get(name) {
            Some(snap) if !snap.removed => {}
            _ => return Err(Error::NotFound(format!("snapshot '{}'", name))),
        }
        let pos = state.chain.iter().position(|n| n == name).unwrap_or(1);
        state.head_seq += 1;
        let head = head_name(state.head_seq);
        state.chain.drain(..pos);
        state.chain.insert(0, head);
        Ok(())
    }

    async fn snapshot_purge(&self) -> Result<()> {
        let delay = self.reachable()?.purge_delay;
        self.purges.fetch_add(1, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.reachable()?;
        let removed: Vec<String> = state
            .snapshots
            .values()
            .filter(|s| s.removed)
            .map(|s| s.name.clone())
            .collect();
        for name in &removed {
            state.snapshots.remove(name);
        }
        state.chain.retain(|n| !removed.contains(n));
        Ok(())
    }

    async fn backup_create(&self, snapshot: &str, target: &str) -> Result<String> {
        let snap = {
            let state = self.reachable()?;
            state
                .snapshots
                .get(snapshot)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("snapshot '{}'", snapshot)))?
        };
        let name = format!("backup-{}", random_id());
        let url = format!("{}?backup={}&volume={}", target, name, self.name);
        let backup = BackupInfo {
            name,
            url: url.clone(),
            snapshot_name: snap.name,
            snapshot_created: snap.created,
            created: format_time_z(Utc::now()),
            size: "0".to_string(),
            volume_name: self.name.clone(),
            volume_size: self.size,
        };
        self.backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.clone(), backup);
        Ok(url)
    }

    async fn backup_restore(&self, url: &str) -> Result<()> {
        let mut state = self.reachable()?;
        let known = self
            .backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(url);
        if !known {
            return Err(Error::NotFound(format!("backup '{}'", url)));
        }
        state.restored.push(url.to_string());
        Ok(())
    }

    async fn backup_delete(&self, url: &str) -> Result<()> {
        let _state = self.reachable()?;
        self.backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
        Ok(())
    }

    async fn backup_list(&self, target: &str, volume: &str) -> Result<Vec<BackupInfo>> {
        let _state = self.reachable()?;
        Ok(self
            .backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|b| b.url.starts_with(target) && b.volume_name == volume)
            .cloned()
            .collect())
    }
}

/// Registry of simulated engines keyed by controller URL
#[derive(Default)]
pub struct SimEngines {
    engines: Mutex<HashMap<String, Arc<SimEngine>>>,
    backups: BackupRegistry,
}

impl SimEngines {
    pub fn new() -> Self {
        Self::default()
    }

    fn engines(&self) -> MutexGuard<'_, HashMap<String, Arc<SimEngine>>> {
        self.engines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bring up (or restart) the engine behind `url` with every replica RW.
    /// Snapshots survive a restart; replica membership does not.
    pub fn seed(&self, url: &str, volume: &str, size: u64, replica_addresses: &[String]) {
        let engine = self
            .engines()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(SimEngine::new(volume, size, self.backups.clone())))
            .clone();
        let mut state = engine.lock();
        state.unreachable = false;
        state.replicas = replica_addresses
            .iter()
            .map(|a| (a.clone(), ReplicaMode::RW))
            .collect();
    }

    /// Take the engine behind `url` down, as when its process is stopped
    pub fn shutdown(&self, url: &str) {
        if let Some(engine) = self.engines().get(url) {
            engine.set_unreachable(true);
        }
    }

    pub fn get(&self, url: &str) -> Option<Arc<SimEngine>> {
        self.engines().get(url).cloned()
    }

    pub fn for_volume(&self, volume: &str) -> Option<Arc<SimEngine>> {
        self.engines().values().find(|e| e.name == volume).cloned()
    }

    pub fn insert_backup(&self, backup: BackupInfo) {
        self.backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(backup.url.clone(), backup);
    }

    pub fn backups(&self) -> Vec<BackupInfo> {
        self.backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl EngineConnector for SimEngines {
    fn connect(&self, url: &str) -> Arc<dyn EngineClient> {
        self.engines()
            .entry(url.to_string())
            .or_insert_with(|| {
                let engine = SimEngine::new(url, 0, self.backups.clone());
                engine.set_unreachable(true);
                Arc::new(engine)
            })
            .clone()
    }
}

#[async_trait]
impl BackupStore for SimEngines {
    async fn get_backup(&self, target: &str, url: &str) -> Result<Option<BackupInfo>> {
        Ok(self
            .backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .filter(|b| b.url.starts_with(target))
            .cloned())
    }
}
