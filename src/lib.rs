//! # blockorc
//!
//! Control plane for replicated block-storage volumes:
//! - Volume lifecycle: create (optionally from a backup), attach, detach, delete
//! - Continuous health checks that replace failed replicas
//! - Host placement with soft anti-affinity and peer forwarding
//! - Snapshots, backups and recurring jobs through a per-volume controller
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!        ┌──────────────────────────────┐
//!        │        VolumeManager         │
//!        │  create / attach / detach    │
//!        └──┬──────────────┬─────────┬──┘
//!           │              │         │ per attached volume
//!   ┌───────▼──────┐ ┌─────▼─────┐ ┌─▼──────────────────────┐
//!   │ Orchestrator │ │ Controller│ │ Monitor                │
//!   │ records and  │ │ + Task    │ │ health / cleanup / jobs│
//!   │ instances    │ │   Queue   │ └────────────────────────┘
//!   └───────┬──────┘ └─────┬─────┘
//!           │              │ HTTP
//!   ┌───────▼──────┐  ┌────▼──────────────┐
//!   │  Scheduler   │──► peer /v1/schedule │
//!   └──────────────┘  └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! blockorc-manager serve \
//!   --host-id host-a \
//!   --bind 0.0.0.0:9500 \
//!   --peer host-b=10.0.0.2:9500 \
//!   --config ./blockorc.toml
//! ```

pub mod common;
pub mod controller;
pub mod manager;
pub mod orchestrator;
pub mod scheduler;
pub mod server;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use manager::VolumeManager;
pub use server::ManagerServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
