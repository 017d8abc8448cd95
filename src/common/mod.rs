//! Common utilities and types shared across blockorc

pub mod config;
pub mod error;
pub mod events;
pub mod storage;
pub mod types;
pub mod utils;

pub use config::{Config, EngineConfig, ManagerConfig};
pub use error::{Error, Errors, Result, ResultExt};
pub use events::{Event, EventLevel, EventLog};
pub use storage::{KVStore, MemStore, Storage};
pub use types::*;
pub use utils::{format_time_z, random_id, round_up_size, validate_name};
