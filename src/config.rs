//! haplane Configuration
//!
//! This module provides configuration structures for a management node:
//! identity, HA mode and timing, the shared store, the HTTP API and the
//! admission filter.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::ha::HaMode;

/// Main haplane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaPlaneConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// High availability configuration
    #[serde(default)]
    pub ha: HaConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Admission filter configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,
}

/// High availability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    /// Which HA mode this node runs in
    #[serde(default)]
    pub mode: HaMode,

    /// Heartbeat and election tick interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long a peer's heartbeat may stand still before it is considered absent
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Upper bound of the random delay before a leadership claim
    #[serde(default = "default_claim_jitter_ms")]
    pub claim_jitter_ms: u64,

    /// Interval between passes of continuous (hot) replication
    #[serde(default = "default_replication_interval_ms")]
    pub replication_interval_ms: u64,

    /// Interval between snapshot writes while this node is a writer
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,
}

/// Which shared store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// SQLite database file shared by all nodes
    #[default]
    Sqlite,
    /// In-process store (single process, tests and demos)
    Memory,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend kind
    #[serde(default)]
    pub backend: StoreBackend,

    /// Path of the shared SQLite database
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Admission filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Path prefixes that bypass HA admission (health and status checks)
    #[serde(default = "default_always_allowed")]
    pub always_allowed: Vec<String>,

    /// Path prefixes treated as read-only regardless of HTTP method
    #[serde(default)]
    pub read_only_paths: Vec<String>,

    /// How long a request waits for an initializing node before it is denied
    #[serde(default = "default_startup_wait_ms")]
    pub startup_wait_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_liveness_timeout_ms() -> u64 {
    4000
}

fn default_claim_jitter_ms() -> u64 {
    200
}

fn default_replication_interval_ms() -> u64 {
    1000
}

fn default_persist_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_always_allowed() -> Vec<String> {
    vec!["/health".to_string(), "/server/ha".to_string()]
}

fn default_startup_wait_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/haplane/shared/store.db")
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            mode: HaMode::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            claim_jitter_ms: default_claim_jitter_ms(),
            replication_interval_ms: default_replication_interval_ms(),
            persist_interval_ms: default_persist_interval_ms(),
        }
    }
}

impl HaConfig {
    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get liveness timeout as Duration
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    /// Get replication interval as Duration
    pub fn replication_interval(&self) -> Duration {
        Duration::from_millis(self.replication_interval_ms)
    }

    /// Get persist interval as Duration
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    /// Validate timing relationships
    pub fn validate(&self) -> crate::Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config("ha.heartbeat_interval_ms must be > 0".into()));
        }
        if self.liveness_timeout_ms < self.heartbeat_interval_ms.saturating_mul(2) {
            return Err(crate::Error::Config(format!(
                "ha.liveness_timeout_ms ({}) must be at least twice ha.heartbeat_interval_ms ({})",
                self.liveness_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.replication_interval_ms == 0 || self.persist_interval_ms == 0 {
            return Err(crate::Error::Config(
                "ha.replication_interval_ms and ha.persist_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            always_allowed: default_always_allowed(),
            read_only_paths: Vec::new(),
            startup_wait_ms: default_startup_wait_ms(),
        }
    }
}

impl AdmissionConfig {
    /// Get startup wait as Duration
    pub fn startup_wait(&self) -> Duration {
        Duration::from_millis(self.startup_wait_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl HaPlaneConfig {
    /// Build a configuration for a node with defaults everywhere else
    pub fn for_node(id: impl Into<String>, mode: HaMode) -> Self {
        Self {
            node: NodeConfig { id: id.into() },
            ha: HaConfig {
                mode,
                ..HaConfig::default()
            },
            store: StoreConfig::default(),
            api: ApiConfig::default(),
            admission: AdmissionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: HaPlaneConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.api.enabled && self.api.bind_address.is_empty() {
            return Err(crate::Error::Config("api.bind_address cannot be empty".into()));
        }

        if self.store.backend == StoreBackend::Sqlite && self.store.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("store.path cannot be empty".into()));
        }

        self.ha.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "mgmt-1"

[ha]
mode = "hot_standby"
heartbeat_interval_ms = 500
liveness_timeout_ms = 2000

[store]
backend = "sqlite"
path = "/shared/haplane.db"

[admission]
read_only_paths = ["/applications/search"]
"#;

        let config = HaPlaneConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "mgmt-1");
        assert_eq!(config.ha.mode, HaMode::HotStandby);
        assert_eq!(config.ha.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.admission.always_allowed, vec!["/health", "/server/ha"]);
        assert_eq!(config.admission.read_only_paths.len(), 1);
    }

    #[test]
    fn test_defaults_for_missing_sections() {
        let config = HaPlaneConfig::from_str("[node]\nid = \"solo\"\n").unwrap();
        assert_eq!(config.ha.mode, HaMode::Disabled);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.ha.liveness_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn test_liveness_timeout_must_exceed_heartbeat() {
        let toml = r#"
[node]
id = "mgmt-1"

[ha]
mode = "auto"
heartbeat_interval_ms = 1000
liveness_timeout_ms = 1500
"#;
        assert!(HaPlaneConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_empty_node_id_rejected() {
        assert!(HaPlaneConfig::from_str("[node]\nid = \"\"\n").is_err());
    }

    #[test]
    fn test_huge_heartbeat_interval_rejected_without_overflow() {
        let mut config = HaPlaneConfig::for_node("mgmt-1", HaMode::Auto);
        config.ha.heartbeat_interval_ms = u64::MAX;
        config.ha.liveness_timeout_ms = u64::MAX - 1;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        config.ha.liveness_timeout_ms = u64::MAX;
        config.validate().unwrap();
    }
}
