//! Volume lifecycle: create, attach, heal, detach, delete
//!
//! The [`VolumeManager`] sequences the orchestrator (processes and records),
//! the controller factory (one live handle per attached volume) and the
//! monitors (one set of loops per attached volume). It keeps no volume state
//! of its own beyond the running monitors and the count of replicas being
//! added per volume; everything else is read back from the orchestrator.
//!
//! Fan-out steps (stopping replicas, marking bad replicas, cleanup) run
//! concurrently and report every failure through [`Errors`].

pub mod jobs;
pub mod monitor;

pub use jobs::validate_jobs;
pub use monitor::{MonitorHandle, MonitorTarget};

use crate::common::{
    round_up_size, validate_name, BgTask, Error, Errors, EventLog, ManagerConfig, RecurringJob,
    ReplicaInfo, ReplicaMode, Result, ResultExt, SettingsInfo, VolumeInfo,
    DEFAULT_STALE_REPLICA_TIMEOUT,
};
use crate::controller::{BackupStore, Controller, ControllerFactory};
use crate::orchestrator::Orchestrator;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct ManagerState {
    monitors: HashMap<String, MonitorHandle>,
    adding_replicas: HashMap<String, usize>,
}

struct Inner {
    orc: Arc<dyn Orchestrator>,
    controllers: Arc<dyn ControllerFactory>,
    backups: Arc<dyn BackupStore>,
    config: ManagerConfig,
    events: Arc<EventLog>,
    state: Mutex<ManagerState>,
}

/// Cheap to clone; clones share the same monitors
#[derive(Clone)]
pub struct VolumeManager {
    inner: Arc<Inner>,
}

impl VolumeManager {
    pub fn new(
        orc: Arc<dyn Orchestrator>,
        controllers: Arc<dyn ControllerFactory>,
        backups: Arc<dyn BackupStore>,
        config: ManagerConfig,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orc,
                controllers,
                backups,
                config,
                events,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Arc<EventLog> {
        self.inner.events.clone()
    }

    pub fn current_host_id(&self) -> String {
        self.inner.orc.current_host_id()
    }

    // === Settings ===

    pub async fn settings(&self) -> Result<SettingsInfo> {
        Ok(self.inner.orc.get_settings().await?.unwrap_or_default())
    }

    pub async fn update_settings(&self, settings: &SettingsInfo) -> Result<()> {
        self.inner
            .orc
            .set_settings(settings)
            .await
            .context("failed to update settings")?;
        self.inner.events.info(format!(
            "Updated settings: backup target '{}', engine image '{}'",
            settings.backup_target, settings.engine_image
        ));
        Ok(())
    }

    // === CRUD ===

    /// Create a volume, restoring it from `from_backup` when set. Creating
    /// an existing name returns the existing volume.
    pub async fn create(&self, mut volume: VolumeInfo) -> Result<VolumeInfo> {
        validate_name(&volume.name)?;
        if let Some(existing) = self.get(&volume.name).await? {
            tracing::debug!("Volume '{}' already exists", volume.name);
            return Ok(existing);
        }

        let settings = self.settings().await?;
        if settings.engine_image.is_empty() {
            return Err(Error::InvalidConfig(
                "engine image not set, cannot create volumes".into(),
            ));
        }
        if volume.number_of_replicas == 0 {
            volume.number_of_replicas = self.inner.config.default_replicas;
        }
        if volume.stale_replica_timeout.is_zero() {
            volume.stale_replica_timeout = DEFAULT_STALE_REPLICA_TIMEOUT;
        }
        validate_jobs(&volume.recurring_jobs)?;

        if let Some(url) = &volume.from_backup {
            if settings.backup_target.is_empty() {
                return Err(Error::InvalidConfig(
                    "backup target not set, cannot restore from backup".into(),
                ));
            }
            let backup = self
                .inner
                .backups
                .get_backup(&settings.backup_target, url)
                .await
                .with_context(|| format!("failed to look up backup '{}'", url))?
                .ok_or_else(|| Error::NotFound(format!("backup '{}'", url)))?;
            if volume.size == 0 {
                volume.size = backup.volume_size;
            }
        }
        volume.size = round_up_size(volume.size).ok_or_else(|| {
            Error::InvalidArgument(format!("volume size {} is too large", volume.size))
        })?;
        volume.controller = None;
        volume.replicas.clear();

        let name = volume.name.clone();
        self.inner
            .orc
            .create_volume(&volume)
            .await
            .with_context(|| format!("failed to create volume '{}'", name))?;

        if let Err(e) = self.provision(&volume).await {
            tracing::warn!("Creating volume '{}' failed, removing it: {}", name, e);
            if let Err(cleanup) = self.delete(&name).await {
                tracing::error!("Failed to remove partial volume '{}': {}", name, cleanup);
            }
            return Err(e);
        }

        self.inner.events.info(format!(
            "Created volume '{}' ({} bytes, {} replicas)",
            name, volume.size, volume.number_of_replicas
        ));
        self.get(&name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", name)))
    }

    /// Create the replicas of a new volume and restore its data
    async fn provision(&self, volume: &VolumeInfo) -> Result<()> {
        let name = volume.name.as_str();
        let replicas = (0..volume.number_of_replicas).map(|_| async move {
            self.inner
                .orc
                .create_replica(name)
                .await
                .with_context(|| format!("failed to create a replica for volume '{}'", name))
                .map(|_| ())
        });
        Errors::collect(join_all(replicas).await)?;

        if let Some(url) = &volume.from_backup {
            self.attach(name).await?;
            let ctrl = self.controller(name).await?;
            ctrl.restore(url)
                .await
                .with_context(|| format!("failed to restore volume '{}' from '{}'", name, url))?;
            self.detach(name).await?;
            self.inner
                .events
                .info(format!("Restored volume '{}' from backup '{}'", name, url));
        }
        Ok(())
    }

    /// Detach, remove every replica, then drop the record. Absent volumes are ignored.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let Some(volume) = self.inner.orc.get_volume(name).await? else {
            tracing::debug!("Volume '{}' already deleted", name);
            return Ok(());
        };
        self.detach(name)
            .await
            .with_context(|| format!("failed to detach volume '{}' before deleting", name))?;

        let removals = volume.replicas.values().map(|replica| async move {
            self.inner
                .orc
                .remove_instance(&replica.instance.id)
                .await
                .with_context(|| {
                    format!("failed to remove replica '{}' of volume '{}'", replica.name, name)
                })
        });
        Errors::collect(join_all(removals).await)?;

        self.inner
            .orc
            .delete_volume(name)
            .await
            .with_context(|| format!("failed to delete volume '{}'", name))?;
        self.state().adding_replicas.remove(name);
        self.inner.events.info(format!("Deleted volume '{}'", name));
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Option<VolumeInfo>> {
        let volume = self
            .inner
            .orc
            .get_volume(name)
            .await
            .with_context(|| format!("failed to get volume '{}'", name))?;
        match volume {
            Some(volume) => Ok(Some(self.with_status(volume).await)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<VolumeInfo>> {
        let volumes = self
            .inner
            .orc
            .list_volumes()
            .await
            .context("failed to list volumes")?;
        Ok(join_all(volumes.into_iter().map(|v| self.with_status(v))).await)
    }

    /// Fill in the derived state and, when attached, the live endpoint
    async fn with_status(&self, mut volume: VolumeInfo) -> VolumeInfo {
        volume.state = Some(volume.derive_state());
        volume.endpoint = None;
        if volume.is_attached() {
            volume.endpoint = self.inner.controllers.endpoint(&volume).await;
        }
        volume
    }

    async fn load(&self, name: &str) -> Result<VolumeInfo> {
        self.inner
            .orc
            .get_volume(name)
            .await
            .with_context(|| format!("failed to get volume '{}'", name))?
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", name)))
    }

    // === Attach / detach ===

    /// Start the volume's controller on this host
    pub async fn attach(&self, name: &str) -> Result<()> {
        let mut volume = self.load(name).await?;
        let current = self.current_host_id();
        let local = volume
            .controller
            .as_ref()
            .map(|c| c.instance.running && c.instance.host_id == current);
        match local {
            Some(true) => return self.start_monitoring(&volume),
            Some(false) => {
                self.detach(name).await.with_context(|| {
                    format!("failed to detach before reattaching volume '{}'", name)
                })?;
                volume = self.load(name).await?;
            }
            None => {}
        }

        let mut chosen: BTreeMap<String, ReplicaInfo> = BTreeMap::new();
        let mut recent_bad: Option<(&String, &ReplicaInfo)> = None;
        for (key, replica) in &volume.replicas {
            if !replica.is_bad() {
                chosen.insert(key.clone(), replica.clone());
            } else if recent_bad
                .map(|(_, r)| replica.bad_timestamp > r.bad_timestamp)
                .unwrap_or(true)
            {
                recent_bad = Some((key, replica));
            }
        }

        let stops = volume
            .replicas
            .values()
            .filter(|r| r.instance.running)
            .map(|r| self.stop_replica(name, r));
        Errors::collect(join_all(stops).await)?;

        if chosen.is_empty() {
            if let Some((key, replica)) = recent_bad {
                tracing::warn!(
                    "Volume '{}' has no good replicas, starting with the most recently failed one '{}'",
                    name,
                    replica.name
                );
                chosen.insert(key.clone(), replica.clone());
            }
        }
        if chosen.is_empty() {
            return Err(Error::NoReplicas(name.to_string()));
        }

        let starts = chosen.values().map(|replica| async move {
            self.inner
                .orc
                .start_instance(&replica.instance.id)
                .await
                .with_context(|| {
                    format!("failed to start replica '{}' for volume '{}'", replica.name, name)
                })
        });
        Errors::collect(join_all(starts).await)?;

        let controller = self
            .inner
            .orc
            .create_controller(name, &chosen)
            .await
            .with_context(|| format!("failed to start the controller for volume '{}'", name))?;
        let host_id = controller.instance.host_id.clone();

        let mut volume = self.load(name).await?;
        volume.controller = Some(controller);
        self.inner.orc.update_volume(&volume).await?;
        self.start_monitoring(&volume)?;

        self.inner.events.info(format!(
            "Attached volume '{}' on host {} with {} replica(s)",
            name,
            host_id,
            chosen.len()
        ));
        Ok(())
    }

    /// Stop monitoring, then the controller and every replica
    pub async fn detach(&self, name: &str) -> Result<()> {
        let volume = self.load(name).await?;
        self.stop_monitoring(name);

        let mut pending: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
        if let Some(ctrl) = &volume.controller {
            let id = ctrl.instance.id.as_str();
            pending.push(
                async move {
                    self.inner.orc.remove_instance(id).await.with_context(|| {
                        format!("failed to remove controller '{}' from volume '{}'", id, name)
                    })
                }
                .boxed(),
            );
        }
        for replica in volume.replicas.values().filter(|r| r.instance.running) {
            pending.push(self.stop_replica(name, replica).boxed());
        }
        Errors::collect(join_all(pending).await)?;

        let mut volume = self.load(name).await?;
        if volume.controller.take().is_some() {
            self.inner.orc.update_volume(&volume).await?;
        }
        self.inner.events.info(format!("Detached volume '{}'", name));
        Ok(())
    }

    async fn stop_replica(&self, volume: &str, replica: &ReplicaInfo) -> Result<()> {
        self.inner
            .orc
            .stop_instance(&replica.instance.id)
            .await
            .with_context(|| {
                format!("failed to stop replica '{}' for volume '{}'", replica.name, volume)
            })
    }

    fn start_monitoring(&self, volume: &VolumeInfo) -> Result<()> {
        let mut state = self.state();
        if state.monitors.contains_key(&volume.name) {
            return Ok(());
        }
        let ctrl = self
            .inner
            .controllers
            .controller(volume)
            .ok_or_else(|| Error::NotAttached(volume.name.clone()))?;
        let handle = monitor::start(
            Arc::new(self.clone()),
            ctrl,
            volume.clone(),
            &self.inner.config,
            self.inner.events.clone(),
        );
        state.monitors.insert(volume.name.clone(), handle);
        tracing::info!("Started monitoring volume '{}'", volume.name);
        Ok(())
    }

    fn stop_monitoring(&self, name: &str) {
        let handle = self.state().monitors.remove(name);
        if let Some(handle) = handle {
            handle.close();
            tracing::info!("Stopped monitoring volume '{}'", name);
        }
        self.inner.controllers.release(name);
    }

    /// Whether the record still uses the controller `volume` was monitored
    /// through. A monitor that lost its controller is stopped.
    async fn still_watched(&self, volume: &VolumeInfo) -> Result<bool> {
        let Some(watched) = volume.controller.as_ref().map(|c| c.instance.id.as_str()) else {
            return Ok(true);
        };
        let latest = self.load(&volume.name).await?;
        let current = latest.controller.as_ref().map(|c| c.instance.id.as_str());
        if current == Some(watched) {
            return Ok(true);
        }
        tracing::info!(
            "Volume '{}' no longer uses controller '{}', leaving it attached",
            volume.name,
            watched
        );
        self.stop_monitor_of(&volume.name, watched);
        Ok(false)
    }

    /// Detach on behalf of the monitor of `volume`. When the volume has
    /// since moved to another controller only that monitor is stopped.
    async fn detach_monitored(&self, volume: &VolumeInfo) -> Result<()> {
        if !self.still_watched(volume).await? {
            return Ok(());
        }
        self.detach(&volume.name).await
    }

    /// Stop the monitor of `name` only if it watches `controller_id`
    fn stop_monitor_of(&self, name: &str, controller_id: &str) {
        let handle = {
            let mut state = self.state();
            let watching = state
                .monitors
                .get(name)
                .map(|h| h.controller_id() == controller_id)
                .unwrap_or(false);
            if watching {
                state.monitors.remove(name)
            } else {
                None
            }
        };
        if let Some(handle) = handle {
            handle.close();
            self.inner.controllers.release(name);
            tracing::info!("Stopped monitoring volume '{}'", name);
        }
    }

    /// Stop every monitor. Volumes stay attached for the next process to resume.
    pub fn shutdown(&self) {
        let monitors = std::mem::take(&mut self.state().monitors);
        for (name, handle) in monitors {
            handle.close();
            self.inner.controllers.release(&name);
        }
        tracing::info!("Stopped all volume monitors");
    }

    /// Restart monitoring of volumes whose controller runs on this host
    pub async fn resume(&self) -> Result<()> {
        let current = self.current_host_id();
        for volume in self.inner.orc.list_volumes().await? {
            let local = volume
                .controller
                .as_ref()
                .map(|c| c.instance.running && c.instance.host_id == current)
                .unwrap_or(false);
            if !local {
                continue;
            }
            if let Err(e) = self.start_monitoring(&volume) {
                tracing::warn!("Cannot resume monitoring of volume '{}': {}", volume.name, e);
            }
        }
        Ok(())
    }

    // === Reconciliation ===

    /// One health check of an attached volume
    pub async fn check_controller(
        &self,
        ctrl: &Arc<dyn Controller>,
        volume: &VolumeInfo,
    ) -> Result<()> {
        let replicas = ctrl
            .get_replica_states()
            .await
            .map_err(|e| Error::controller_failed(&volume.name, e))?;
        tracing::debug!(
            "Checking '{}', number_of_replicas={}: controller knows {} replicas",
            volume.name,
            volume.number_of_replicas,
            replicas.len()
        );

        let (mut good, mut wo) = (0usize, 0usize);
        let mut pending: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
        for replica in &replicas {
            match replica.mode {
                Some(ReplicaMode::RW) => good += 1,
                Some(ReplicaMode::WO) => wo += 1,
                _ => {
                    self.inner.events.warn(format!(
                        "Marking bad replica '{}' of volume '{}'",
                        replica.instance.address, volume.name
                    ));
                    pending.push(
                        async move {
                            ctrl.remove_replica(replica).await.with_context(|| {
                                format!(
                                    "failed to remove ERR replica '{}' from volume '{}'",
                                    replica.instance.address, volume.name
                                )
                            })
                        }
                        .boxed(),
                    );
                    pending.push(
                        async move {
                            self.inner
                                .orc
                                .mark_bad_replica(&volume.name, replica)
                                .await
                                .with_context(|| {
                                    format!(
                                        "failed to mark replica '{}' bad for volume '{}'",
                                        replica.instance.address, volume.name
                                    )
                                })
                        }
                        .boxed(),
                    );
                }
            }
        }
        Errors::collect(join_all(pending).await)?;

        if good == 0 {
            self.inner.events.error(format!(
                "Volume '{}' has no more good replicas, shutting it down",
                volume.name
            ));
            self.detach_monitored(volume).await?;
            return Err(Error::NoGoodReplicas(volume.name.clone()));
        }

        let adding = self.adding_replicas(&volume.name);
        tracing::debug!(
            "'{}' replicas by state: RW={}, WO={}, adding={}",
            volume.name,
            good,
            wo,
            adding
        );
        if good < volume.number_of_replicas && wo == 0 && adding == 0 {
            self.create_and_add_replica(&volume.name, ctrl.clone())
                .await?;
        }
        if good + wo > volume.number_of_replicas {
            tracing::warn!(
                "Volume '{}' has more replicas than needed: has {}, needs {}",
                volume.name,
                good + wo,
                volume.number_of_replicas
            );
        }
        Ok(())
    }

    /// Create a replica now and add it to the controller in the background
    async fn create_and_add_replica(&self, name: &str, ctrl: Arc<dyn Controller>) -> Result<()> {
        let replica = self
            .inner
            .orc
            .create_replica(name)
            .await
            .with_context(|| format!("failed to create a replica for volume '{}'", name))?;
        self.track_adding(name, true);

        let manager = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            match ctrl.add_replica(&replica).await {
                Ok(()) => manager.inner.events.info(format!(
                    "Added replica '{}' to volume '{}'",
                    replica.name, name
                )),
                Err(e) => {
                    manager.inner.events.error(format!(
                        "Failed to add replica '{}' to volume '{}': {}",
                        replica.name, name, e
                    ));
                    if let Err(e) = manager.inner.orc.remove_instance(&replica.instance.id).await {
                        tracing::error!(
                            "Failed to remove stale replica '{}' of volume '{}': {}",
                            replica.name,
                            name,
                            e
                        );
                    }
                }
            }
            manager.track_adding(&name, false);
        });
        Ok(())
    }

    fn adding_replicas(&self, name: &str) -> usize {
        self.state().adding_replicas.get(name).copied().unwrap_or(0)
    }

    fn track_adding(&self, name: &str, started: bool) {
        let mut state = self.state();
        let count = state.adding_replicas.entry(name.to_string()).or_insert(0);
        if started {
            *count += 1;
        } else {
            *count = count.saturating_sub(1);
        }
        if *count == 0 {
            state.adding_replicas.remove(name);
        }
    }

    /// Stop bad replicas and remove those kept past the keep period
    pub async fn cleanup(&self, volume: &VolumeInfo) -> Result<()> {
        let volume = self
            .load(&volume.name)
            .await
            .with_context(|| format!("error getting volume '{}'", volume.name))?;
        tracing::debug!("Running cleanup, volume '{}'", volume.name);

        let now = Utc::now();
        let keep = self.inner.config.keep_bad_replicas_period();
        let name = volume.name.as_str();
        let mut pending: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
        for replica in volume.replicas.values() {
            let Some(bad_since) = replica.bad_timestamp else {
                continue;
            };
            let expired = now
                .signed_duration_since(bad_since)
                .to_std()
                .map(|age| age > keep)
                .unwrap_or(false);
            if expired {
                pending.push(
                    async move {
                        self.inner
                            .orc
                            .remove_instance(&replica.instance.id)
                            .await
                            .with_context(|| {
                                format!(
                                    "error removing old bad replica '{}', volume '{}'",
                                    replica.name, name
                                )
                            })
                    }
                    .boxed(),
                );
            } else if replica.instance.running {
                pending.push(
                    async move {
                        self.inner
                            .orc
                            .stop_instance(&replica.instance.id)
                            .await
                            .with_context(|| {
                                format!(
                                    "error stopping bad replica '{}', volume '{}'",
                                    replica.name, name
                                )
                            })
                    }
                    .boxed(),
                );
            }
        }
        Errors::collect(join_all(pending).await)
    }

    // === Snapshots, backups, jobs ===

    /// Controller of a volume attached on this host
    pub async fn controller(&self, name: &str) -> Result<Arc<dyn Controller>> {
        let volume = self.load(name).await?;
        let Some(info) = volume.controller.as_ref().filter(|c| c.instance.running) else {
            return Err(Error::NotAttached(name.to_string()));
        };
        let current = self.current_host_id();
        if info.instance.host_id != current {
            return Err(Error::WrongHost {
                expected: info.instance.host_id.clone(),
                current,
            });
        }
        self.inner
            .controllers
            .controller(&volume)
            .ok_or_else(|| Error::NotAttached(name.to_string()))
    }

    pub async fn latest_bg_tasks(&self, name: &str) -> Result<Vec<BgTask>> {
        Ok(self.controller(name).await?.latest_bg_tasks())
    }

    /// Replace the volume's recurring jobs, effective at once when attached
    pub async fn update_recurring_jobs(
        &self,
        name: &str,
        jobs: Vec<RecurringJob>,
    ) -> Result<VolumeInfo> {
        validate_jobs(&jobs)?;
        let mut volume = self.load(name).await?;
        volume.recurring_jobs = jobs.clone();
        self.inner
            .orc
            .update_volume(&volume)
            .await
            .with_context(|| format!("failed to update recurring jobs of volume '{}'", name))?;
        if let Some(handle) = self.state().monitors.get(name) {
            handle.update_jobs(jobs);
        }
        tracing::info!(
            "Volume '{}' now has {} recurring job(s)",
            name,
            volume.recurring_jobs.len()
        );
        Ok(self.with_status(volume).await)
    }
}

#[async_trait]
impl MonitorTarget for VolumeManager {
    async fn check_controller(
        &self,
        ctrl: &Arc<dyn Controller>,
        volume: &VolumeInfo,
    ) -> Result<()> {
        if !self.still_watched(volume).await? {
            return Ok(());
        }
        VolumeManager::check_controller(self, ctrl, volume).await
    }

    async fn cleanup(&self, volume: &VolumeInfo) -> Result<()> {
        VolumeManager::cleanup(self, volume).await
    }

    async fn detach(&self, volume: &VolumeInfo) -> Result<()> {
        self.detach_monitored(volume).await
    }

    async fn settings(&self) -> Result<SettingsInfo> {
        VolumeManager::settings(self).await
    }
}
