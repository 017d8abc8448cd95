//! Configuration for blockorc components

use crate::common::{Error, Result, SettingsInfo};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `BLOCKORC_MANAGER__CLEANUP_PERIOD_SECS=60`.
pub const ENV_PREFIX: &str = "BLOCKORC";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host ID of this manager (unique within the cluster)
    #[serde(default)]
    pub host_id: Option<String>,

    /// Bind address for the manager HTTP endpoint
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Volume manager and monitor tuning
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Engine endpoint client tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Initial cluster settings, applied when the store has none
    #[serde(default)]
    pub settings: SettingsInfo,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9500))
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_id: None,
            bind_addr: default_bind_addr(),
            log_level: default_log_level(),
            manager: ManagerConfig::default(),
            engine: EngineConfig::default(),
            settings: SettingsInfo::default(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `BLOCKORC_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
        let cfg = builder
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let cfg: Config = cfg
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.manager.validate()?;
        Ok(cfg)
    }
}

/// Volume manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Health-check period of an attached volume
    #[serde(default = "default_monitoring_period")]
    pub monitoring_period_ms: u64,

    /// Consecutive failed checks before the volume is detached
    #[serde(default = "default_monitoring_max_retries")]
    pub monitoring_max_retries: u32,

    /// Bad-replica cleanup period
    #[serde(default = "default_cleanup_period")]
    pub cleanup_period_secs: u64,

    /// How long a bad replica is kept before removal
    #[serde(default = "default_keep_bad_replicas")]
    pub keep_bad_replicas_secs: u64,

    /// Hard ceiling for a snapshot purge
    #[serde(default = "default_purge_timeout")]
    pub purge_timeout_secs: u64,

    /// Replication factor applied when a create request leaves it unset
    #[serde(default = "default_replicas")]
    pub default_replicas: usize,
}

fn default_monitoring_period() -> u64 {
    2_000
}
fn default_monitoring_max_retries() -> u32 {
    3
}
fn default_cleanup_period() -> u64 {
    120
}
fn default_keep_bad_replicas() -> u64 {
    2 * 3600
}
fn default_purge_timeout() -> u64 {
    15 * 60
}
fn default_replicas() -> usize {
    crate::common::types::DEFAULT_NUMBER_OF_REPLICAS
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            monitoring_period_ms: default_monitoring_period(),
            monitoring_max_retries: default_monitoring_max_retries(),
            cleanup_period_secs: default_cleanup_period(),
            keep_bad_replicas_secs: default_keep_bad_replicas(),
            purge_timeout_secs: default_purge_timeout(),
            default_replicas: default_replicas(),
        }
    }
}

impl ManagerConfig {
    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_period_secs)
    }

    pub fn keep_bad_replicas_period(&self) -> Duration {
        Duration::from_secs(self.keep_bad_replicas_secs)
    }

    pub fn purge_timeout(&self) -> Duration {
        Duration::from_secs(self.purge_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitoring_period_ms == 0 {
            return Err(Error::InvalidConfig(
                "monitoring_period_ms must be positive".into(),
            ));
        }
        if self.cleanup_period_secs == 0 {
            return Err(Error::InvalidConfig(
                "cleanup_period_secs must be positive".into(),
            ));
        }
        if self.default_replicas == 0 {
            return Err(Error::InvalidConfig(
                "default_replicas must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Engine client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-request timeout against an engine endpoint
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Backup inspection service used to resolve restore sources
    #[serde(default = "default_backup_service_url")]
    pub backup_service_url: String,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_backup_service_url() -> String {
    "http://127.0.0.1:9503".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            backup_service_url: default_backup_service_url(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ManagerConfig::default();
        assert_eq!(cfg.monitoring_period(), Duration::from_secs(2));
        assert_eq!(cfg.monitoring_max_retries, 3);
        assert_eq!(cfg.cleanup_period(), Duration::from_secs(120));
        assert_eq!(cfg.keep_bad_replicas_period(), Duration::from_secs(7200));
        assert_eq!(cfg.purge_timeout(), Duration::from_secs(900));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
host_id = "host-a"
bind_addr = "127.0.0.1:9600"

[manager]
monitoring_period_ms = 500
keep_bad_replicas_secs = 60

[settings]
engine_image = "engine:v1"
"#
        )
        .unwrap();

        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.host_id.as_deref(), Some("host-a"));
        assert_eq!(cfg.bind_addr.port(), 9600);
        assert_eq!(cfg.manager.monitoring_period_ms, 500);
        assert_eq!(cfg.manager.monitoring_max_retries, 3);
        assert_eq!(cfg.manager.keep_bad_replicas_secs, 60);
        assert_eq!(cfg.settings.engine_image, "engine:v1");
        assert_eq!(cfg.settings.backup_target, "");
    }

    #[test]
    fn test_invalid_manager_config() {
        let cfg = ManagerConfig {
            monitoring_period_ms: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
