//! Integration tests for controller loss and manager restarts

use blockorc::common::{
    EventLog, HostInfo, InstanceInfo, ManagerConfig, ReplicaMode, ScheduleItem, SettingsInfo,
    Storage, VolumeInfo, VolumeState,
};
use blockorc::controller::sim::SimEngines;
use blockorc::controller::EngineControllers;
use blockorc::orchestrator::{MemoryCluster, MemoryOrchestrator, Orchestrator};
use blockorc::scheduler::ScheduleForwarder;
use blockorc::{Error, Result, VolumeManager};
use std::sync::Arc;
use std::time::Duration;

struct Isolated;

#[async_trait::async_trait]
impl ScheduleForwarder for Isolated {
    async fn forward(&self, host: &HostInfo, _item: &ScheduleItem) -> Result<InstanceInfo> {
        Err(Error::ConnectionFailed(host.address.clone()))
    }
}

/// One manager process on host-a over `store` and `engines`
async fn manager(store: &Storage, engines: &Arc<SimEngines>) -> VolumeManager {
    let cluster = Arc::new(MemoryCluster::new(
        HostInfo {
            uuid: "host-a".into(),
            name: "node-a".into(),
            address: "127.0.0.1:9500".into(),
        },
        store.clone(),
        Some(engines.clone()),
    ));
    cluster.register().unwrap();
    let orc = Arc::new(MemoryOrchestrator::new(cluster, Arc::new(Isolated)));
    if orc.get_settings().await.unwrap().is_none() {
        orc.set_settings(&SettingsInfo {
            backup_target: String::new(),
            engine_image: "engine:v1".into(),
        })
        .await
        .unwrap();
    }
    let events = Arc::new(EventLog::default());
    let controllers = Arc::new(EngineControllers::new(
        engines.clone(),
        Duration::from_secs(5),
        events.clone(),
    ));
    let config = ManagerConfig {
        monitoring_period_ms: 20,
        cleanup_period_secs: 3_600,
        ..Default::default()
    };
    VolumeManager::new(orc, controllers, engines.clone(), config, events)
}

async fn wait_for(
    manager: &VolumeManager,
    name: &str,
    check: impl Fn(&VolumeInfo) -> bool,
) -> VolumeInfo {
    for _ in 0..500 {
        let volume = manager.get(name).await.unwrap().unwrap();
        if check(&volume) {
            return volume;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("volume '{}' never reached the expected state", name);
}

async fn wait_detached(manager: &VolumeManager, name: &str) {
    let done = format!("Detached volume '{}'", name);
    for _ in 0..500 {
        if manager.events().list().iter().any(|e| e.message == done) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("volume '{}' was never detached", name);
}

#[tokio::test]
async fn test_lost_controller_detaches_volume() {
    let store = Storage::new_memory();
    let engines = Arc::new(SimEngines::new());
    let manager = manager(&store, &engines).await;
    manager
        .create(VolumeInfo::new("v1", 4096, 2))
        .await
        .unwrap();
    manager.attach("v1").await.unwrap();

    let url = manager
        .get("v1")
        .await
        .unwrap()
        .unwrap()
        .controller
        .unwrap()
        .instance
        .address;
    engines.shutdown(&url);

    wait_detached(&manager, "v1").await;
    let volume = manager.get("v1").await.unwrap().unwrap();
    assert!(!volume.is_attached());
    assert_eq!(volume.state, Some(VolumeState::Detached));
    // losing the controller says nothing about the replicas
    assert!(volume.replicas.values().all(|r| !r.is_bad()));
    assert!(manager
        .events()
        .list()
        .iter()
        .any(|e| e.message.contains("Health check of volume 'v1' failed")));

    manager.attach("v1").await.unwrap();
    let volume = manager.get("v1").await.unwrap().unwrap();
    assert_eq!(volume.state, Some(VolumeState::Healthy));
    assert_ne!(volume.controller.unwrap().instance.address, url);
}

#[tokio::test]
async fn test_restarted_manager_resumes_monitoring() {
    let store = Storage::new_memory();
    let engines = Arc::new(SimEngines::new());
    let first = manager(&store, &engines).await;
    first
        .create(VolumeInfo::new("v1", 4096, 2))
        .await
        .unwrap();
    first.attach("v1").await.unwrap();
    let volume = first.get("v1").await.unwrap().unwrap();
    // the old process goes away without detaching
    first.shutdown();
    drop(first);

    let second = manager(&store, &engines).await;
    second.resume().await.unwrap();

    let url = volume.controller.unwrap().instance.address;
    let failed = volume.replicas.values().next().unwrap().clone();
    engines
        .get(&url)
        .unwrap()
        .set_mode(&failed.instance.address, ReplicaMode::ERR);

    let volume = wait_for(&second, "v1", |v| {
        v.replicas.len() == 3 && v.state == Some(VolumeState::Healthy)
    })
    .await;
    assert!(volume.replicas[&failed.name].is_bad());
}
