//! LedgerMirror Configuration
//!
//! This module provides configuration structures for an instance taking
//! part in ledger replication.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::model::Strategy;

/// Main LedgerMirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerMirrorConfig {
    /// Instance-specific configuration
    pub instance: InstanceConfig,

    /// Replication behaviour
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Instance-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Public instance identifier (domain-like, e.g. "finance.example.com")
    pub id: String,

    /// Data directory for the ledger database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Private key location (defaults to `<data_dir>/secrets/instance.key`)
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Rank of this instance under primary-wins (1 = primary). When unset,
    /// priority 1 mirrors win and all other mirrors lose.
    #[serde(default)]
    pub priority: Option<i32>,
}

/// Replication behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Interval between scheduled sync-all rounds in seconds (0 = disabled)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Per-call transport timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Look-back window used when a mirror has never been synced
    #[serde(default = "default_lookback_days")]
    pub first_sync_lookback_days: i64,

    /// Only serve pulls to callers registered as mirrors
    #[serde(default = "default_true")]
    pub require_known_peer: bool,

    /// Strategy used for entity kinds without a stored policy
    #[serde(default)]
    pub default_strategy: Strategy,
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

    /// Bearer token required on management routes
    #[serde(default)]
    pub admin_token: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_sync_interval_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_lookback_days() -> i64 {
    7
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/ledgermirror")
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            first_sync_lookback_days: default_lookback_days(),
            require_known_peer: true,
            default_strategy: Strategy::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
            admin_token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LedgerMirrorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: LedgerMirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.instance.id.trim().is_empty() {
            return Err(crate::Error::Config("instance.id cannot be empty".into()));
        }

        if matches!(self.instance.priority, Some(p) if p < 1) {
            return Err(crate::Error::Config("instance.priority must be >= 1".into()));
        }

        if self.replication.request_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "replication.request_timeout_secs must be > 0".into(),
            ));
        }

        if self.replication.first_sync_lookback_days < 0 {
            return Err(crate::Error::Config(
                "replication.first_sync_lookback_days cannot be negative".into(),
            ));
        }

        if matches!(self.api.admin_token.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(crate::Error::Config("api.admin_token cannot be blank".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.instance.data_dir
    }

    /// Get the ledger database path
    pub fn database_path(&self) -> PathBuf {
        self.instance.data_dir.join("ledger.db")
    }

    /// Get the private key path
    pub fn key_path(&self) -> PathBuf {
        self.instance
            .key_file
            .clone()
            .unwrap_or_else(|| self.instance.data_dir.join("secrets").join("instance.key"))
    }

    /// Get the transport timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.request_timeout_secs)
    }

    /// Get the scheduler interval, if scheduled rounds are enabled
    pub fn sync_interval(&self) -> Option<Duration> {
        match self.replication.sync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get the first-sync look-back window
    pub fn first_sync_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.replication.first_sync_lookback_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[instance]
id = "finance.example.com"
data_dir = "/var/lib/ledgermirror"
priority = 2

[replication]
sync_interval_secs = 60
first_sync_lookback_days = 14

[replication.default_strategy]
strategy = "primary_wins"
primary_instance_id = "hq.example.com"

[api]
bind_address = "127.0.0.1:9090"
admin_token = "s3cret"
"#;

        let config = LedgerMirrorConfig::from_str(toml).unwrap();
        assert_eq!(config.instance.id, "finance.example.com");
        assert_eq!(config.instance.priority, Some(2));
        assert_eq!(config.sync_interval(), Some(Duration::from_secs(60)));
        assert_eq!(config.first_sync_lookback(), chrono::Duration::days(14));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.replication.default_strategy,
            Strategy::PrimaryWins { primary_instance_id: Some("hq.example.com".into()) }
        );
        assert_eq!(
            config.key_path(),
            PathBuf::from("/var/lib/ledgermirror/secrets/instance.key")
        );
    }

    #[test]
    fn test_defaults() {
        let config = LedgerMirrorConfig::from_str("[instance]\nid = \"a.example\"\n").unwrap();
        assert_eq!(config.instance.priority, None);
        assert_eq!(config.replication.first_sync_lookback_days, 7);
        assert_eq!(config.replication.default_strategy, Strategy::LastWriteWins);
        assert!(config.replication.require_known_peer);
        assert!(config.api.admin_token.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(LedgerMirrorConfig::from_str("[instance]\nid = \"\"\n").is_err());
        assert!(LedgerMirrorConfig::from_str("[instance]\nid = \"a\"\npriority = 0\n").is_err());
        assert!(LedgerMirrorConfig::from_str(
            "[instance]\nid = \"a\"\n[replication]\nrequest_timeout_secs = 0\n"
        )
        .is_err());
    }
}
