//! Recurring snapshot and backup jobs
//!
//! Schedules are six-field cron expressions (seconds first) evaluated in UTC.
//! A snapshot job creates a labeled snapshot and trims older ones of the same
//! job down to `retain`. A backup job creates a labeled snapshot and queues a
//! backup task carrying the retention; the controller's worker trims old
//! backups once the backup completes.

use crate::common::{
    format_time_z, random_id, BackupBgTask, BackupRetention, BgTask, BgTaskKind, Error,
    JobTask, RecurringJob, Result, SnapshotInfo,
};
use crate::controller::{Controller, BACKUP_JOB_LABEL, JOB_LABEL};
use crate::manager::monitor::MonitorTarget;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Reject unnamed, padded or duplicate job names and unparsable schedules.
pub fn validate_jobs(jobs: &[RecurringJob]) -> Result<()> {
    let mut names = HashSet::new();
    for job in jobs {
        if job.name.is_empty() || job.name.trim() != job.name {
            return Err(Error::InvalidArgument(format!(
                "invalid recurring job name '{}'",
                job.name
            )));
        }
        if !names.insert(job.name.as_str()) {
            return Err(Error::InvalidArgument(format!(
                "duplicate recurring job '{}'",
                job.name
            )));
        }
        Schedule::from_str(&job.cron).map_err(|e| {
            Error::InvalidArgument(format!(
                "invalid cron '{}' for job '{}': {}",
                job.cron, job.name, e
            ))
        })?;
    }
    Ok(())
}

/// `{job}-{timestamp}-{random}`
pub fn snapshot_name(job: &str) -> String {
    format!("{}-{}-{}", job, format_time_z(Utc::now()), random_id())
}

struct Planned {
    job: RecurringJob,
    schedule: Schedule,
    next: DateTime<Utc>,
}

fn plan(volume: &str, jobs: &[RecurringJob]) -> Vec<Planned> {
    jobs.iter()
        .filter_map(|job| match Schedule::from_str(&job.cron) {
            Ok(schedule) => {
                let next = schedule.upcoming(Utc).next()?;
                Some(Planned {
                    job: job.clone(),
                    schedule,
                    next,
                })
            }
            Err(e) => {
                tracing::warn!(
                    "Skipping recurring job '{}' of volume '{}': bad cron '{}': {}",
                    job.name,
                    volume,
                    job.cron,
                    e
                );
                None
            }
        })
        .collect()
}

/// Fire the volume's jobs on schedule until shutdown. A new job set from
/// `jobs` replaces the current plan.
pub async fn run_jobs(
    target: Arc<dyn MonitorTarget>,
    ctrl: Arc<dyn Controller>,
    volume: String,
    mut jobs: watch::Receiver<Vec<RecurringJob>>,
    mut shutdown: watch::Receiver<bool>,
) {
    'plan: loop {
        let current = jobs.borrow_and_update().clone();
        let mut planned = plan(&volume, &current);
        if !planned.is_empty() {
            tracing::info!(
                "Scheduled {} recurring job(s) for volume '{}'",
                planned.len(),
                volume
            );
        }

        loop {
            if *shutdown.borrow() {
                break 'plan;
            }
            let wait = planned
                .iter()
                .map(|p| p.next)
                .min()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            let sleep = async {
                match wait {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sleep => {}
                changed = jobs.changed() => {
                    if changed.is_err() {
                        break 'plan;
                    }
                    continue 'plan;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break 'plan;
                    }
                    continue;
                }
            }

            let now = Utc::now();
            for p in planned.iter_mut().filter(|p| p.next <= now) {
                if let Err(e) = run_job(target.as_ref(), ctrl.as_ref(), &p.job).await {
                    tracing::error!(
                        "Recurring job '{}' of volume '{}' failed: {}",
                        p.job.name,
                        volume,
                        e
                    );
                }
                p.next = p
                    .schedule
                    .after(&now)
                    .next()
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
            }
            planned.retain(|p| p.next != DateTime::<Utc>::MAX_UTC);
        }
    }
    tracing::debug!("Recurring jobs of volume '{}' stopped", volume);
}

/// Run one job now
pub async fn run_job(
    target: &dyn MonitorTarget,
    ctrl: &dyn Controller,
    job: &RecurringJob,
) -> Result<()> {
    match job.task {
        JobTask::Snapshot => snapshot_job(ctrl, job).await,
        JobTask::Backup => backup_job(target, ctrl, job).await,
    }
}

async fn snapshot_job(ctrl: &dyn Controller, job: &RecurringJob) -> Result<()> {
    let labels = BTreeMap::from([(JOB_LABEL.to_string(), job.name.clone())]);
    let name = ctrl.create_snapshot(&snapshot_name(&job.name), &labels).await?;
    tracing::info!(
        "Recurring job '{}' created snapshot '{}', volume '{}'",
        job.name,
        name,
        ctrl.name()
    );
    if job.retain == 0 {
        return Ok(());
    }

    let mut snapshots: Vec<SnapshotInfo> = ctrl
        .list_snapshots()
        .await?
        .into_iter()
        .filter(|s| !s.removed && s.labels.get(JOB_LABEL) == Some(&job.name))
        .collect();
    snapshots.sort_by(|a, b| (&a.created, &a.name).cmp(&(&b.created, &b.name)));

    let excess = snapshots.len().saturating_sub(job.retain);
    if excess == 0 {
        return Ok(());
    }
    for snap in &snapshots[..excess] {
        tracing::info!(
            "Recurring job cleanup: snapshot '{}', volume '{}'",
            snap.name,
            ctrl.name()
        );
        ctrl.delete_snapshot(&snap.name).await?;
    }
    ctrl.purge_snapshots().await
}

async fn backup_job(
    target: &dyn MonitorTarget,
    ctrl: &dyn Controller,
    job: &RecurringJob,
) -> Result<()> {
    let backup_target = target.settings().await?.backup_target;
    if backup_target.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "backup target not set, cannot run backup job '{}'",
            job.name
        )));
    }

    let labels = BTreeMap::from([
        (JOB_LABEL.to_string(), job.name.clone()),
        (BACKUP_JOB_LABEL.to_string(), job.name.clone()),
    ]);
    let snapshot = ctrl.create_snapshot(&snapshot_name(&job.name), &labels).await?;
    let num = ctrl
        .bg_task_queue()
        .put(BgTask::new(BgTaskKind::Backup(BackupBgTask {
            snapshot: snapshot.clone(),
            backup_target,
            retention: Some(BackupRetention {
                job: job.name.clone(),
                retain: job.retain,
            }),
        })))?;
    tracing::info!(
        "Recurring job '{}' queued backup #{} of snapshot '{}', volume '{}'",
        job.name,
        num,
        snapshot,
        ctrl.name()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{EventLog, SettingsInfo, VolumeInfo};
    use crate::controller::sim::SimEngines;
    use crate::controller::{EngineConnector, EngineController, SnapshotOps};
    use async_trait::async_trait;

    const URL: &str = "http://v1-controller:9501";

    struct Settings(SettingsInfo);

    #[async_trait]
    impl MonitorTarget for Settings {
        async fn check_controller(
            &self,
            _ctrl: &Arc<dyn Controller>,
            _volume: &VolumeInfo,
        ) -> Result<()> {
            Ok(())
        }
        async fn cleanup(&self, _volume: &VolumeInfo) -> Result<()> {
            Ok(())
        }
        async fn detach(&self, _volume: &VolumeInfo) -> Result<()> {
            Ok(())
        }
        async fn settings(&self) -> Result<SettingsInfo> {
            Ok(self.0.clone())
        }
    }

    fn settings(backup_target: &str) -> Settings {
        Settings(SettingsInfo {
            backup_target: backup_target.to_string(),
            engine_image: "engine:v1".to_string(),
        })
    }

    fn setup() -> (Arc<SimEngines>, Arc<EngineController>) {
        let engines = Arc::new(SimEngines::new());
        engines.seed(URL, "v1", 1 << 20, &["tcp://r1:9502".to_string()]);
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

    fn job(name: &str, task: JobTask, cron: &str, retain: usize) -> RecurringJob {
        RecurringJob {
            name: name.to_string(),
            task,
            cron: cron.to_string(),
            retain,
        }
    }

    #[test]
    fn test_validate_jobs() {
        assert!(validate_jobs(&[job("hourly", JobTask::Snapshot, "0 0 * * * *", 2)]).is_ok());
        assert!(validate_jobs(&[]).is_ok());
        assert!(validate_jobs(&[job("", JobTask::Snapshot, "0 0 * * * *", 2)]).is_err());
        assert!(validate_jobs(&[job(" padded", JobTask::Snapshot, "0 0 * * * *", 2)]).is_err());
        assert!(validate_jobs(&[job("bad", JobTask::Backup, "every hour", 2)]).is_err());
        assert!(validate_jobs(&[
            job("twice", JobTask::Snapshot, "0 0 * * * *", 1),
            job("twice", JobTask::Backup, "0 0 * * * *", 1),
        ])
        .is_err());
    }

    #[test]
    fn test_snapshot_name() {
        let name = snapshot_name("daily");
        assert!(name.starts_with("daily-"));
        assert!(name.contains('Z'));
        assert_ne!(name, snapshot_name("daily"));
    }

    #[tokio::test]
    async fn test_snapshot_job_retention() {
        let (engines, ctrl) = setup();
        let target = settings("");
        let daily = job("daily", JobTask::Snapshot, "0 0 0 * * *", 2);

        ctrl.create_snapshot("manual", &BTreeMap::new()).await.unwrap();
        for _ in 0..3 {
            run_job(&target, ctrl.as_ref(), &daily).await.unwrap();
        }

        let snapshots = ctrl.list_snapshots().await.unwrap();
        let kept: Vec<_> = snapshots
            .iter()
            .filter(|s| s.labels.get(JOB_LABEL).map(String::as_str) == Some("daily"))
            .collect();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|s| !s.removed));
        assert!(snapshots.iter().any(|s| s.name == "manual"));
        assert_eq!(engines.get(URL).unwrap().purge_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_job_retain_zero_keeps_all() {
        let (engines, ctrl) = setup();
        let target = settings("");
        let keep = job("keep", JobTask::Snapshot, "0 0 0 * * *", 0);
        for _ in 0..3 {
            run_job(&target, ctrl.as_ref(), &keep).await.unwrap();
        }
        assert_eq!(ctrl.list_snapshots().await.unwrap().len(), 3);
        assert_eq!(engines.get(URL).unwrap().purge_count(), 0);
    }

    #[tokio::test]
    async fn test_backup_job_queues_task() {
        let (engines, ctrl) = setup();
        let target = settings("s3://bucket@us-east-1/");
        let nightly = job("nightly", JobTask::Backup, "0 0 0 * * *", 3);

        run_job(&target, ctrl.as_ref(), &nightly).await.unwrap();

        let snapshots = ctrl.list_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            snapshots[0].labels.get(BACKUP_JOB_LABEL).map(String::as_str),
            Some("nightly")
        );

        for _ in 0..100 {
            if !engines.backups().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let backups = engines.backups();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].snapshot_name, snapshots[0].name);
    }

    #[tokio::test]
    async fn test_backup_job_requires_target() {
        let (_engines, ctrl) = setup();
        let nightly = job("nightly", JobTask::Backup, "0 0 0 * * *", 3);
        let err = run_job(&settings(""), ctrl.as_ref(), &nightly)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(ctrl.list_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_jobs_fires_on_schedule() {
        let (_engines, ctrl) = setup();
        let (jobs_tx, jobs_rx) = watch::channel(Vec::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = tokio::spawn(run_jobs(
            Arc::new(settings("")),
            ctrl.clone(),
            "v1".to_string(),
            jobs_rx,
            shutdown_rx,
        ));

        jobs_tx
            .send(vec![job("every-second", JobTask::Snapshot, "* * * * * *", 0)])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();

        assert!(!ctrl.list_snapshots().await.unwrap().is_empty());
    }
}
