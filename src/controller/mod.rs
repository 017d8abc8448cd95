//! Per-volume controller: the manager's handle on a running volume
//!
//! An [`EngineController`] is bound to the control endpoint of one attached
//! volume. It reconciles replica state, changes replica membership, and runs
//! snapshot and backup operations. Long backups go through the volume's
//! [`TaskQueue`] and are executed one at a time by a dedicated worker.

pub mod engine;
pub mod queue;
pub mod sim;
pub mod status;

pub use engine::{BackupStore, EngineClient, EngineConnector, EngineInfo, HttpConnector};
pub use queue::TaskQueue;

use crate::common::{
    BackupBgTask, BackupInfo, BackupRetention, BgTask, BgTaskKind, Error, EventLog, ReplicaInfo,
    Result, ResultExt, SnapshotInfo, VolumeInfo,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Name the engine reports for the live head in snapshot listings
pub const VOLUME_HEAD: &str = sim::VOLUME_HEAD;

/// Label carrying the recurring job that created a snapshot
pub const JOB_LABEL: &str = "job";
/// Label marking snapshots taken for a recurring backup
pub const BACKUP_JOB_LABEL: &str = "backupJob";
/// Snapshots kept behind by a recurring backup job
pub const RETAIN_BACKUP_SNAPSHOTS: usize = 2;

#[async_trait]
pub trait SnapshotOps: Send + Sync {
    /// Returns the name of the created snapshot
    async fn create_snapshot(&self, name: &str, labels: &BTreeMap<String, String>)
        -> Result<String>;
    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>>;
    async fn get_snapshot(&self, name: &str) -> Result<Option<SnapshotInfo>>;
    async fn delete_snapshot(&self, name: &str) -> Result<()>;
    async fn revert_snapshot(&self, name: &str) -> Result<()>;
    /// Single-flight: a purge requested while one is running succeeds at once.
    async fn purge_snapshots(&self) -> Result<()>;
}

#[async_trait]
pub trait BackupOps: Send + Sync {
    /// Queue a backup of `snapshot`; returns once the task is queued.
    async fn start_backup(&self, snapshot: &str, target: &str) -> Result<()>;
    async fn restore(&self, backup_url: &str) -> Result<()>;
    async fn delete_backup(&self, url: &str) -> Result<()>;
    async fn list_backups(&self, target: &str) -> Result<Vec<BackupInfo>>;
    /// Last completed task, then the running one
    fn latest_bg_tasks(&self) -> Vec<BgTask>;
    fn bg_task_queue(&self) -> Arc<TaskQueue>;
}

#[async_trait]
pub trait Controller: SnapshotOps + BackupOps {
    fn name(&self) -> &str;
    fn url(&self) -> &str;
    async fn get_replica_states(&self) -> Result<Vec<ReplicaInfo>>;
    async fn add_replica(&self, replica: &ReplicaInfo) -> Result<()>;
    async fn remove_replica(&self, replica: &ReplicaInfo) -> Result<()>;
    /// Frontend endpoint of the live volume, empty when it cannot be read
    async fn endpoint(&self) -> String;
}

#[derive(Default)]
struct TaskSlots {
    running: Option<BgTask>,
    last: Option<BgTask>,
}

pub struct EngineController {
    name: String,
    url: String,
    engine: Arc<dyn EngineClient>,
    /// Serializes backups and purges against the engine
    lock: tokio::sync::Mutex<()>,
    purge_slot: Semaphore,
    purge_timeout: Duration,
    queue: Arc<TaskQueue>,
    tasks: Mutex<TaskSlots>,
    events: Arc<EventLog>,
}

impl EngineController {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        engine: Arc<dyn EngineClient>,
        purge_timeout: Duration,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            engine,
            lock: tokio::sync::Mutex::new(()),
            purge_slot: Semaphore::new(1),
            purge_timeout,
            queue: Arc::new(TaskQueue::new()),
            tasks: Mutex::new(TaskSlots::default()),
            events,
        }
    }

    /// Spawn the background worker. It exits once the queue is closed.
    pub fn start(self) -> Arc<Self> {
        let ctrl = Arc::new(self);
        let worker = ctrl.clone();
        tokio::spawn(async move { worker.run_bg_tasks().await });
        ctrl
    }

    pub fn close(&self) {
        self.queue.close();
    }

    fn task_slots(&self) -> MutexGuard<'_, TaskSlots> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_bg_tasks(&self) {
        while let Some(task) = self.queue.take().await {
            self.run_task(task).await;
        }
        tracing::debug!("Background worker of volume '{}' stopped", self.name);
    }

    async fn run_task(&self, mut task: BgTask) {
        task.started = Some(Utc::now());
        self.task_slots().running = Some(task.clone());

        let result = match &task.task {
            BgTaskKind::Backup(backup) => self.run_backup(backup).await,
        };

        task.finished = Some(Utc::now());
        task.error = result.as_ref().err().map(|e| e.to_string());
        match &result {
            Ok(()) => self.events.info(format!(
                "Completed background task #{} of volume '{}'",
                task.num, self.name
            )),
            Err(e) => self.events.error(format!(
                "Error running background task #{} of volume '{}': {}",
                task.num, self.name, e
            )),
        }

        let mut slots = self.task_slots();
        slots.running = None;
        slots.last = Some(task);
    }

    async fn run_backup(&self, task: &BackupBgTask) -> Result<()> {
        {
            let _guard = self.lock.lock().await;
            let url = self
                .engine
                .backup_create(&task.snapshot, &task.backup_target)
                .await
                .with_context(|| {
                    format!(
                        "error creating backup for snapshot '{}', backupTarget '{}'",
                        task.snapshot, task.backup_target
                    )
                })?;
            tracing::info!(
                "Completed backup: volume '{}', snapshot '{}', url '{}'",
                self.name,
                task.snapshot,
                url
            );
        }

        if let Some(retention) = &task.retention {
            if let Err(e) = self.cleanup_backup_snapshots(&retention.job).await {
                tracing::error!("Error cleaning up backup snapshots: {}", e);
            }
            self.cleanup_backups(retention, &task.backup_target).await?;
        }
        Ok(())
    }

    /// Keep only the newest snapshots taken for a recurring backup job
    async fn cleanup_backup_snapshots(&self, job: &str) -> Result<()> {
        let mut snapshots: Vec<SnapshotInfo> = self
            .list_snapshots()
            .await?
            .into_iter()
            .filter(|s| {
                !s.removed
                    && s.labels.get(JOB_LABEL).map(String::as_str) == Some(job)
                    && s.labels.get(BACKUP_JOB_LABEL).map(String::as_str) == Some(job)
            })
            .collect();
        snapshots.sort_by(|a, b| (&a.created, &a.name).cmp(&(&b.created, &b.name)));

        let excess = snapshots.len().saturating_sub(RETAIN_BACKUP_SNAPSHOTS);
        for snap in &snapshots[..excess] {
            tracing::info!(
                "Recurring job cleanup: backup snapshot '{}', volume '{}'",
                snap.name,
                self.name
            );
            self.delete_snapshot(&snap.name).await?;
        }
        Ok(())
    }

    /// Keep `retain` backups of a recurring job in the target
    async fn cleanup_backups(&self, retention: &BackupRetention, target: &str) -> Result<()> {
        if retention.retain == 0 {
            return Ok(());
        }
        let prefix = format!("{}-", retention.job);
        let mut backups: Vec<BackupInfo> = self
            .list_backups(target)
            .await?
            .into_iter()
            .filter(|b| b.snapshot_name.starts_with(&prefix))
            .collect();
        backups.sort_by(|a, b| (&a.created, &a.url).cmp(&(&b.created, &b.url)));

        let excess = backups.len().saturating_sub(retention.retain);
        for backup in &backups[..excess] {
            tracing::info!(
                "Recurring job cleanup: backup '{}', volume '{}'",
                backup.url,
                self.name
            );
            self.delete_backup(&backup.url).await?;
        }
        Ok(())
    }

    async fn snapshot_map(&self) -> Result<BTreeMap<String, SnapshotInfo>> {
        let mut listing = self
            .engine
            .snapshot_list()
            .await
            .with_context(|| format!("error listing snapshots, volume '{}'", self.name))?;
        listing.remove(VOLUME_HEAD);
        Ok(listing)
    }
}

#[async_trait]
impl SnapshotOps for EngineController {
    async fn create_snapshot(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        if let Some((k, v)) = labels
            .iter()
            .find(|(k, v)| k.contains('=') || v.contains('='))
        {
            return Err(Error::InvalidArgument(format!(
                "label '{}={}' must not contain '='",
                k, v
            )));
        }
        self.engine
            .snapshot_create(name, labels)
            .await
            .with_context(|| format!("error creating snapshot '{}', volume '{}'", name, self.name))
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self.snapshot_map().await?.into_values().collect())
    }

    async fn get_snapshot(&self, name: &str) -> Result<Option<SnapshotInfo>> {
        Ok(self.snapshot_map().await?.remove(name))
    }

    async fn delete_snapshot(&self, name: &str) -> Result<()> {
        self.engine
            .snapshot_delete(name)
            .await
            .with_context(|| format!("error deleting snapshot '{}', volume '{}'", name, self.name))
    }

    async fn revert_snapshot(&self, name: &str) -> Result<()> {
        self.engine
            .snapshot_revert(name)
            .await
            .with_context(|| format!("error reverting to snapshot '{}', volume '{}'", name, self.name))
    }

    async fn purge_snapshots(&self) -> Result<()> {
        let _permit = match self.purge_slot.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::info!(
                    "Snapshot purge already in progress, volume '{}', skipping",
                    self.name
                );
                return Ok(());
            }
        };
        let _guard = self.lock.lock().await;
        match tokio::time::timeout(self.purge_timeout, self.engine.snapshot_purge()).await {
            Ok(result) => result
                .with_context(|| format!("error purging snapshots, volume '{}'", self.name)),
            Err(_) => Err(Error::Timeout(format!(
                "purging snapshots of volume '{}' exceeded {:?}",
                self.name, self.purge_timeout
            ))),
        }
    }
}

#[async_trait]
impl BackupOps for EngineController {
    async fn start_backup(&self, snapshot: &str, target: &str) -> Result<()> {
        if self.get_snapshot(snapshot).await?.is_none() {
            return Err(Error::NotFound(format!(
                "could not find snapshot '{}' to backup, volume '{}'",
                snapshot, self.name
            )));
        }
        let num = self.queue.put(BgTask::new(BgTaskKind::Backup(BackupBgTask {
            snapshot: snapshot.to_string(),
            backup_target: target.to_string(),
            retention: None,
        })))?;
        tracing::debug!("Queued backup task #{} for volume '{}'", num, self.name);
        Ok(())
    }

    async fn restore(&self, backup_url: &str) -> Result<()> {
        self.engine
            .backup_restore(backup_url)
            .await
            .with_context(|| format!("error restoring backup '{}'", backup_url))
    }

    async fn delete_backup(&self, url: &str) -> Result<()> {
        self.engine
            .backup_delete(url)
            .await
            .with_context(|| format!("error deleting backup '{}'", url))
    }

    async fn list_backups(&self, target: &str) -> Result<Vec<BackupInfo>> {
        self.engine
            .backup_list(target, &self.name)
            .await
            .with_context(|| format!("error listing backups, volume '{}'", self.name))
    }

    fn latest_bg_tasks(&self) -> Vec<BgTask> {
        let slots = self.task_slots();
        slots.last.iter().chain(slots.running.iter()).cloned().collect()
    }

    fn bg_task_queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }
}

#[async_trait]
impl Controller for EngineController {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn get_replica_states(&self) -> Result<Vec<ReplicaInfo>> {
        let entries = self
            .engine
            .replica_listing()
            .await
            .with_context(|| format!("cannot list replicas of controller '{}'", self.name))?;
        status::classify(entries)
    }

    async fn add_replica(&self, replica: &ReplicaInfo) -> Result<()> {
        self.engine
            .add_replica(&replica.instance.address)
            .await
            .with_context(|| {
                format!(
                    "failed to add replica address='{}' to controller '{}'",
                    replica.instance.address, self.name
                )
            })
    }

    async fn remove_replica(&self, replica: &ReplicaInfo) -> Result<()> {
        self.engine
            .remove_replica(&replica.instance.address)
            .await
            .with_context(|| {
                format!(
                    "failed to rm replica address='{}' from controller '{}'",
                    replica.instance.address, self.name
                )
            })
    }

    async fn endpoint(&self) -> String {
        match self.engine.info().await {
            Ok(info) => info.endpoint,
            Err(e) => {
                tracing::warn!("Fail to get frontend info of volume '{}': {}", self.name, e);
                String::new()
            }
        }
    }
}

/// Hands out the controller of an attached volume
#[async_trait]
pub trait ControllerFactory: Send + Sync {
    /// `None` when the volume has no controller. Only the host running the
    /// controller asks for it; the result is cached until [`release`].
    ///
    /// [`release`]: ControllerFactory::release
    fn controller(&self, volume: &VolumeInfo) -> Option<Arc<dyn Controller>>;
    /// Drop the cached controller of `name`, closing its task queue
    fn release(&self, name: &str);
    /// Frontend endpoint of the volume's controller, looked up without caching
    async fn endpoint(&self, volume: &VolumeInfo) -> Option<String>;
}

/// Controllers over engine clients, cached per volume
pub struct EngineControllers {
    connector: Arc<dyn EngineConnector>,
    purge_timeout: Duration,
    events: Arc<EventLog>,
    cache: Mutex<HashMap<String, Arc<EngineController>>>,
}

impl EngineControllers {
    pub fn new(
        connector: Arc<dyn EngineConnector>,
        purge_timeout: Duration,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            connector,
            purge_timeout,
            events,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Arc<EngineController>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of controllers currently held
    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache().is_empty()
    }
}

#[async_trait]
impl ControllerFactory for EngineControllers {
    fn controller(&self, volume: &VolumeInfo) -> Option<Arc<dyn Controller>> {
        let url = volume.controller.as_ref()?.instance.address.clone();
        if url.is_empty() {
            return None;
        }

        let mut cache = self.cache();
        if let Some(existing) = cache.get(&volume.name) {
            if existing.url == url {
                return Some(existing.clone());
            }
            // the volume moved to a new controller
            existing.close();
        }
        let ctrl = EngineController::new(
            volume.name.clone(),
            url.clone(),
            self.connector.connect(&url),
            self.purge_timeout,
            self.events.clone(),
        )
        .start();
        cache.insert(volume.name.clone(), ctrl.clone());
        Some(ctrl)
    }

    fn release(&self, name: &str) {
        if let Some(ctrl) = self.cache().remove(name) {
            ctrl.close();
        }
    }

    async fn endpoint(&self, volume: &VolumeInfo) -> Option<String> {
        let url = volume.controller.as_ref()?.instance.address.as_str();
        if url.is_empty() {
            return None;
        }
        match self.connector.connect(url).info().await {
            Ok(info) if !info.endpoint.is_empty() => Some(info.endpoint),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(
                    "Fail to get frontend info of volume '{}': {}",
                    volume.name,
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ControllerInfo, InstanceInfo, InstanceType, ReplicaMode};
    use sim::SimEngines;

    const URL: &str = "http://v1-controller:9501";

    fn setup() -> (Arc<SimEngines>, Arc<EngineController>) {
        let engines = Arc::new(SimEngines::new());
        engines.seed(
            URL,
            "v1",
            1 << 20,
            &["tcp://r1:9502".to_string(), "tcp://r2:9502".to_string()],
        );
        let ctrl = EngineController::new(
            "v1",
            URL,
            engines.connect(URL),
            Duration::from_secs(5),
            Arc::new(EventLog::default()),
        )
        .start();
        (engines, ctrl)
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn wait_finished(ctrl: &EngineController, count: usize) -> Vec<BgTask> {
        for _ in 0..100 {
            let tasks = ctrl.latest_bg_tasks();
            if tasks.len() == 1 && tasks[0].num as usize == count && tasks[0].finished.is_some()
            {
                return tasks;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background task #{} did not finish", count);
    }

    #[tokio::test]
    async fn test_replica_states() {
        let (engines, ctrl) = setup();
        engines
            .get(URL)
            .unwrap()
            .set_mode("tcp://r2:9502", ReplicaMode::ERR);
        let states = ctrl.get_replica_states().await.unwrap();
        let modes: Vec<_> = states.iter().map(|r| r.mode).collect();
        assert_eq!(modes, vec![Some(ReplicaMode::RW), Some(ReplicaMode::ERR)]);
    }

    #[tokio::test]
    async fn test_unreachable_engine() {
        let (engines, ctrl) = setup();
        engines.shutdown(URL);
        assert!(ctrl.get_replica_states().await.is_err());
        assert_eq!(ctrl.endpoint().await, "");
    }

    #[tokio::test]
    async fn test_remove_replica_context() {
        let (_engines, ctrl) = setup();
        let err = ctrl
            .remove_replica(&ReplicaInfo::observed("tcp://r9:9502", ReplicaMode::ERR))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("tcp://r9:9502"));
        assert!(msg.contains("'v1'"));
    }

    #[tokio::test]
    async fn test_snapshot_labels_rejected() {
        let (_engines, ctrl) = setup();
        let err = ctrl
            .create_snapshot("s1", &labels(&[("a=b", "c")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(ctrl
            .create_snapshot("s1", &labels(&[("a", "b=c")]))
            .await
            .is_err());
        assert!(ctrl.list_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_excludes_head() {
        let (_engines, ctrl) = setup();
        ctrl.create_snapshot("s1", &BTreeMap::new()).await.unwrap();
        let names: Vec<String> = ctrl
            .list_snapshots()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["s1"]);
        assert!(ctrl.get_snapshot(VOLUME_HEAD).await.unwrap().is_none());
        assert!(ctrl.get_snapshot("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_single_flight() {
        let (engines, ctrl) = setup();
        let engine = engines.get(URL).unwrap();
        engine.set_purge_delay(Duration::from_millis(100));

        let (a, b) = tokio::join!(ctrl.purge_snapshots(), ctrl.purge_snapshots());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(engine.purge_count(), 1);

        // the slot is free again afterwards
        ctrl.purge_snapshots().await.unwrap();
        assert_eq!(engine.purge_count(), 2);
    }

    #[tokio::test]
    async fn test_purge_timeout() {
        let engines = Arc::new(SimEngines::new());
        engines.seed(URL, "v1", 4096, &[]);
        engines
            .get(URL)
            .unwrap()
            .set_purge_delay(Duration::from_millis(200));
        let ctrl = EngineController::new(
            "v1",
            URL,
            engines.connect(URL),
            Duration::from_millis(20),
            Arc::new(EventLog::default()),
        );
        assert!(matches!(
            ctrl.purge_snapshots().await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_start_backup() {
        let (engines, ctrl) = setup();
        let missing = ctrl.start_backup("nope", "vfs:///backups").await;
        assert!(matches!(missing, Err(Error::NotFound(_))));

        ctrl.create_snapshot("s1", &BTreeMap::new()).await.unwrap();
        ctrl.start_backup("s1", "vfs:///backups").await.unwrap();

        let tasks = wait_finished(&ctrl, 1).await;
        assert!(tasks[0].started.is_some());
        assert_eq!(tasks[0].error, None);
        assert_eq!(engines.backups().len(), 1);
        assert_eq!(ctrl.list_backups("vfs:///backups").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_retention() {
        let (engines, ctrl) = setup();
        let target = "vfs:///backups";
        let job_labels = labels(&[(JOB_LABEL, "nightly"), (BACKUP_JOB_LABEL, "nightly")]);
        for i in 1..=3 {
            let name = format!("nightly-{}", i);
            ctrl.create_snapshot(&name, &job_labels).await.unwrap();
            ctrl.bg_task_queue()
                .put(BgTask::new(BgTaskKind::Backup(BackupBgTask {
                    snapshot: name,
                    backup_target: target.to_string(),
                    retention: Some(BackupRetention {
                        job: "nightly".to_string(),
                        retain: 2,
                    }),
                })))
                .unwrap();
            wait_finished(&ctrl, i).await;
        }

        assert_eq!(engines.backups().len(), 2);
        let live: Vec<SnapshotInfo> = ctrl
            .list_snapshots()
            .await
            .unwrap()
            .into_iter()
            .filter(|s| !s.removed)
            .collect();
        assert_eq!(live.len(), RETAIN_BACKUP_SNAPSHOTS);
    }

    #[tokio::test]
    async fn test_factory_caches_and_releases() {
        let engines = Arc::new(SimEngines::new());
        engines.seed(URL, "v1", 4096, &[]);
        let factory = EngineControllers::new(
            engines.clone(),
            Duration::from_secs(5),
            Arc::new(EventLog::default()),
        );

        let mut volume = VolumeInfo::new("v1", 4096, 2);
        assert!(factory.controller(&volume).is_none());

        let mut instance = InstanceInfo::new("v1-controller", InstanceType::Controller);
        instance.address = URL.to_string();
        instance.running = true;
        volume.controller = Some(ControllerInfo { instance });

        let a = factory.controller(&volume).unwrap();
        let b = factory.controller(&volume).unwrap();
        assert!(Arc::ptr_eq(&a.bg_task_queue(), &b.bg_task_queue()));

        factory.release("v1");
        assert!(a.bg_task_queue().is_closed());
        let c = factory.controller(&volume).unwrap();
        assert!(!c.bg_task_queue().is_closed());
        assert_eq!(factory.len(), 1);
    }

    #[tokio::test]
    async fn test_factory_endpoint_is_not_cached() {
        let engines = Arc::new(SimEngines::new());
        engines.seed(URL, "v1", 4096, &[]);
        let factory = EngineControllers::new(
            engines.clone(),
            Duration::from_secs(5),
            Arc::new(EventLog::default()),
        );

        let mut volume = VolumeInfo::new("v1", 4096, 2);
        assert!(factory.endpoint(&volume).await.is_none());

        let mut instance = InstanceInfo::new("v1-controller", InstanceType::Controller);
        instance.address = URL.to_string();
        instance.running = true;
        volume.controller = Some(ControllerInfo { instance });

        assert_eq!(
            factory.endpoint(&volume).await.as_deref(),
            Some("/dev/blockorc/v1")
        );
        assert!(factory.is_empty());

        engines.shutdown(URL);
        assert!(factory.endpoint(&volume).await.is_none());
    }
}
