//! Control loops of an attached volume
//!
//! Three tasks per volume: the health check, the bad-replica cleanup and the
//! recurring jobs. Each loop waits a full period after its previous run
//! returns, so runs never overlap. All of them stop at their next wait once
//! the [`MonitorHandle`] is closed or dropped.

use crate::common::{
    Error, EventLog, ManagerConfig, RecurringJob, Result, SettingsInfo, VolumeInfo,
};
use crate::controller::Controller;
use crate::manager::jobs;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Callbacks the loops drive
#[async_trait]
pub trait MonitorTarget: Send + Sync {
    async fn check_controller(&self, ctrl: &Arc<dyn Controller>, volume: &VolumeInfo)
        -> Result<()>;
    async fn cleanup(&self, volume: &VolumeInfo) -> Result<()>;
    /// Detach the volume from the controller this monitor watches
    async fn detach(&self, volume: &VolumeInfo) -> Result<()>;
    async fn settings(&self) -> Result<SettingsInfo>;
}

pub struct MonitorHandle {
    controller_id: String,
    shutdown: watch::Sender<bool>,
    jobs: watch::Sender<Vec<RecurringJob>>,
}

impl MonitorHandle {
    /// Instance id of the watched controller
    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Replace the volume's recurring jobs
    pub fn update_jobs(&self, jobs: Vec<RecurringJob>) {
        let _ = self.jobs.send(jobs);
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Start monitoring `volume` through `ctrl`.
pub fn start(
    target: Arc<dyn MonitorTarget>,
    ctrl: Arc<dyn Controller>,
    volume: VolumeInfo,
    config: &ManagerConfig,
    events: Arc<EventLog>,
) -> MonitorHandle {
    let controller_id = volume
        .controller
        .as_ref()
        .map(|c| c.instance.id.clone())
        .unwrap_or_default();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (jobs_tx, jobs_rx) = watch::channel(volume.recurring_jobs.clone());

    tokio::spawn(health_loop(
        target.clone(),
        ctrl.clone(),
        volume.clone(),
        config.monitoring_period(),
        config.monitoring_max_retries,
        events,
        shutdown_rx.clone(),
    ));
    tokio::spawn(cleanup_loop(
        target.clone(),
        volume.clone(),
        config.cleanup_period(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(jobs::run_jobs(target, ctrl, volume.name, jobs_rx, shutdown_rx));

    MonitorHandle {
        controller_id,
        shutdown,
        jobs: jobs_tx,
    }
}

/// Wait one period. `false` once the monitor is shutting down.
pub(crate) async fn tick(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(period) => !*shutdown.borrow(),
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

async fn health_loop(
    target: Arc<dyn MonitorTarget>,
    ctrl: Arc<dyn Controller>,
    volume: VolumeInfo,
    period: Duration,
    max_retries: u32,
    events: Arc<EventLog>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failed_attempts = 0u32;
    while tick(period, &mut shutdown).await {
        let err = match target.check_controller(&ctrl, &volume).await {
            Ok(()) => {
                failed_attempts = 0;
                continue;
            }
            Err(e) if e.is_fatal() => e,
            Err(e) => {
                failed_attempts += 1;
                if failed_attempts < max_retries {
                    tracing::warn!(
                        "Error checking volume '{}', going to retry ({}/{}): {}",
                        volume.name,
                        failed_attempts,
                        max_retries,
                        e
                    );
                    continue;
                }
                Error::Context {
                    message: format!(
                        "repeated errors checking volume '{}', giving up",
                        volume.name
                    ),
                    source: Box::new(e),
                }
            }
        };

        // the failing check may already have detached the volume
        if *shutdown.borrow() {
            break;
        }
        events.error(format!("Health check of volume '{}' failed: {}", volume.name, err));
        if let Err(e) = target.detach(&volume).await {
            tracing::error!("Error detaching failed volume '{}': {}", volume.name, e);
        }
        break;
    }
    tracing::debug!("Health monitor of volume '{}' stopped", volume.name);
}

async fn cleanup_loop(
    target: Arc<dyn MonitorTarget>,
    volume: VolumeInfo,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    while tick(period, &mut shutdown).await {
        if let Err(e) = target.cleanup(&volume).await {
            tracing::warn!("Error cleaning up volume '{}': {}", volume.name, e);
        }
    }
    tracing::debug!("Cleanup loop of volume '{}' stopped", volume.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ReplicaMode;
    use crate::controller::sim::SimEngines;
    use crate::controller::{EngineConnector, EngineController};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted check results, then succeeds
    #[derive(Default)]
    struct Script {
        results: Mutex<VecDeque<Result<()>>>,
        checks: AtomicUsize,
        cleanups: AtomicUsize,
        detaches: AtomicUsize,
    }

    #[async_trait]
    impl MonitorTarget for Script {
        async fn check_controller(
            &self,
            _ctrl: &Arc<dyn Controller>,
            _volume: &VolumeInfo,
        ) -> Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
        async fn cleanup(&self, _volume: &VolumeInfo) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Err(Error::from("cleanup failure is only logged"))
        }
        async fn detach(&self, _volume: &VolumeInfo) -> Result<()> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn settings(&self) -> Result<SettingsInfo> {
            Ok(SettingsInfo::default())
        }
    }

    fn controller() -> Arc<dyn Controller> {
        let engines = SimEngines::new();
        engines.seed("http://c:9501", "v1", 4096, &[]);
        engines
            .get("http://c:9501")
            .unwrap()
            .set_mode("tcp://r:9502", ReplicaMode::RW);
        Arc::new(EngineController::new(
            "v1",
            "http://c:9501",
            engines.connect("http://c:9501"),
            Duration::from_secs(1),
            Arc::new(EventLog::default()),
        ))
    }

    fn config() -> ManagerConfig {
        ManagerConfig {
            monitoring_period_ms: 5,
            cleanup_period_secs: 3600,
            ..Default::default()
        }
    }

    fn launch(script: Arc<Script>) -> MonitorHandle {
        start(
            script,
            controller(),
            VolumeInfo::new("v1", 4096, 2),
            &config(),
            Arc::new(EventLog::default()),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_fatal_error_detaches_at_once() {
        let script = Arc::new(Script::default());
        script
            .results
            .lock()
            .unwrap()
            .push_back(Err(Error::controller_failed("v1", Error::from("gone"))));
        let _handle = launch(script.clone());
        settle().await;

        assert_eq!(script.checks.load(Ordering::SeqCst), 1);
        assert_eq!(script.detaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let script = Arc::new(Script::default());
        for _ in 0..5 {
            script
                .results
                .lock()
                .unwrap()
                .push_back(Err(Error::from("transient")));
        }
        let _handle = launch(script.clone());
        settle().await;

        assert_eq!(script.checks.load(Ordering::SeqCst), 3);
        assert_eq!(script.detaches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_resets_retries() {
        let script = Arc::new(Script::default());
        {
            let mut results = script.results.lock().unwrap();
            results.push_back(Err(Error::from("transient")));
            results.push_back(Err(Error::from("transient")));
            results.push_back(Ok(()));
            results.push_back(Err(Error::from("transient")));
            results.push_back(Err(Error::from("transient")));
        }
        let handle = launch(script.clone());
        settle().await;
        handle.close();

        assert!(script.checks.load(Ordering::SeqCst) > 5);
        assert_eq!(script.detaches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_stops_loops() {
        let script = Arc::new(Script::default());
        let handle = launch(script.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(handle);
        settle().await;
        let checks = script.checks.load(Ordering::SeqCst);
        settle().await;

        assert_eq!(script.checks.load(Ordering::SeqCst), checks);
        assert_eq!(script.detaches.load(Ordering::SeqCst), 0);
        assert_eq!(script.cleanups.load(Ordering::SeqCst), 0);
    }
}
