//! Manager host server
//!
//! Wires one host of the cluster: the store-backed orchestrator, the
//! scheduler with its HTTP forwarder, the controller factory, the volume
//! manager, and the HTTP endpoint peers forward placement requests to.

pub mod http;

pub use http::{create_router, ServerState};

use crate::common::{Config, EventLog, HostInfo, Result, ResultExt, Storage};
use crate::controller::engine::HttpBackupStore;
use crate::controller::sim::SimEngines;
use crate::controller::{BackupStore, EngineConnector, EngineControllers, HttpConnector};
use crate::manager::VolumeManager;
use crate::orchestrator::{MemoryCluster, MemoryOrchestrator, Orchestrator};
use crate::scheduler::SchedulerClient;
use std::sync::Arc;

/// Which engine client the controllers use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// In-process simulated engines
    Sim,
    /// Engine control endpoints over HTTP
    Http,
}

pub struct ManagerServer {
    config: Config,
    host: HostInfo,
    peers: Vec<HostInfo>,
    store: Storage,
    engine: EngineMode,
}

impl ManagerServer {
    pub fn new(
        config: Config,
        host: HostInfo,
        peers: Vec<HostInfo>,
        store: Storage,
        engine: EngineMode,
    ) -> Self {
        Self {
            config,
            host,
            peers,
            store,
            engine,
        }
    }

    /// Build the manager and the router without binding a socket
    pub async fn build(&self) -> Result<(VolumeManager, ServerState)> {
        let events = Arc::new(EventLog::default());
        let request_timeout = self.config.engine.request_timeout();

        let (connector, backups, sim): (
            Arc<dyn EngineConnector>,
            Arc<dyn BackupStore>,
            Option<Arc<SimEngines>>,
        ) = match self.engine {
            EngineMode::Sim => {
                let engines = Arc::new(SimEngines::new());
                (engines.clone(), engines.clone(), Some(engines))
            }
            EngineMode::Http => {
                let connector = HttpConnector::new(request_timeout)?;
                let backups =
                    HttpBackupStore::new(&connector, &self.config.engine.backup_service_url);
                (Arc::new(connector), Arc::new(backups), None)
            }
        };

        let cluster = Arc::new(MemoryCluster::new(
            self.host.clone(),
            self.store.clone(),
            sim,
        ));
        cluster.register().context("failed to register this host")?;
        for peer in &self.peers {
            MemoryCluster::new(peer.clone(), self.store.clone(), None)
                .register()
                .with_context(|| format!("failed to register peer {}", peer.uuid))?;
        }

        let forwarder = Arc::new(SchedulerClient::new(request_timeout)?);
        let orc = Arc::new(MemoryOrchestrator::new(cluster, forwarder));
        if orc.get_settings().await?.is_none() {
            orc.set_settings(&self.config.settings).await?;
            tracing::info!(
                "Initialized settings: backup target '{}', engine image '{}'",
                self.config.settings.backup_target,
                self.config.settings.engine_image
            );
        }

        let controllers = Arc::new(EngineControllers::new(
            connector,
            self.config.manager.purge_timeout(),
            events.clone(),
        ));
        let scheduler = orc.scheduler();
        let manager = VolumeManager::new(
            orc,
            controllers,
            backups,
            self.config.manager.clone(),
            events,
        );
        let state = ServerState {
            scheduler,
            manager: manager.clone(),
        };
        Ok((manager, state))
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting manager: {}", self.host.uuid);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  Engine: {:?}", self.engine);
        tracing::info!("  Peers: {}", self.peers.len());

        let (manager, state) = self.build().await?;
        manager.resume().await?;

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Manager ready on {}", listener.local_addr()?);
        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        manager.shutdown();
        tracing::info!("Manager {} stopped", self.host.uuid);
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
