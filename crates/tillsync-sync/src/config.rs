//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TILLSYNC_DEVICE_ID=abc-123                                         │
//! │     TILLSYNC_AUTHORITY_URL=https://api.example.com                     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tillsync/sync.toml (Linux)                               │
//! │     ~/Library/Application Support/com.tillsync.tillsync/sync.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     5 minute interval, batch of 25, auto-generated device_id           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [authority]
//! base_url = "https://api.example.com/v1"
//! health_path = "/health"
//! request_timeout_secs = 15
//!
//! [sync]
//! interval_secs = 300
//! batch_size = 25
//! run_budget_secs = 60
//!
//! [network]
//! probe_endpoints = ["https://www.google.com/generate_204"]
//! reachability_timeout_secs = 10
//!
//! [conflicts]
//! products = "merge"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use tillsync_core::{ConflictPolicy, ConflictStrategy, EntityTable};

use crate::error::{SyncError, SyncResult};

/// Smallest push batch the queue accepts.
pub const MIN_BATCH_SIZE: usize = 10;

/// Largest push batch the queue accepts.
pub const MAX_BATCH_SIZE: usize = 50;

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Till".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Authority Settings
// =============================================================================

/// Where the remote authority lives and how to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritySettings {
    /// Base URL; collection paths are appended to it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path probed during reachability checks.
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Bound on every pull and push call (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Sent as a bearer token when set.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        AuthoritySettings {
            base_url: default_base_url(),
            health_path: default_health_path(),
            request_timeout_secs: default_request_timeout(),
            api_key: None,
        }
    }
}

impl AuthoritySettings {
    /// Parsed base URL.
    pub fn base(&self) -> SyncResult<Url> {
        Ok(Url::parse(&self.base_url)?)
    }

    /// Full health check URL (base URL with the health path appended).
    pub fn health_url(&self) -> SyncResult<Url> {
        let joined = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.health_path.trim_start_matches('/')
        );
        Ok(Url::parse(&joined)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Orchestrator behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Periodic trigger interval (seconds).
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Queue items taken per dequeue.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Soft wall-clock bound of one run (seconds).
    #[serde(default = "default_run_budget")]
    pub run_budget_secs: u64,
}

fn default_interval() -> u64 {
    300
}

fn default_batch_size() -> usize {
    25
}

fn default_run_budget() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            interval_secs: default_interval(),
            batch_size: default_batch_size(),
            run_budget_secs: default_run_budget(),
        }
    }
}

// =============================================================================
// Network Settings
// =============================================================================

/// Network monitor behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// External endpoints probed alongside the authority's health path.
    #[serde(default = "default_probe_endpoints")]
    pub probe_endpoints: Vec<String>,

    /// Bound on a reachability test (seconds).
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout_secs: u64,

    /// How often the link watcher samples the interface (seconds).
    #[serde(default = "default_link_poll")]
    pub link_poll_interval_secs: u64,
}

fn default_probe_endpoints() -> Vec<String> {
    vec!["https://www.google.com/generate_204".to_string()]
}

fn default_reachability_timeout() -> u64 {
    10
}

fn default_link_poll() -> u64 {
    5
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings {
            probe_endpoints: default_probe_endpoints(),
            reachability_timeout_secs: default_reachability_timeout(),
            link_poll_interval_secs: default_link_poll(),
        }
    }
}

// =============================================================================
// Conflict Settings
// =============================================================================

/// Per-table strategy overrides. Unset tables keep the built-in default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<ConflictStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sales: Option<ConflictStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sale_items: Option<ConflictStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_movements: Option<ConflictStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cashier_orders: Option<ConflictStrategy>,
}

impl ConflictSettings {
    /// Builds the policy table handed to the resolver.
    pub fn policy(&self) -> ConflictPolicy {
        let overrides = [
            (EntityTable::Products, self.products),
            (EntityTable::Sales, self.sales),
            (EntityTable::SaleItems, self.sale_items),
            (EntityTable::StockMovements, self.stock_movements),
            (EntityTable::CashierOrders, self.cashier_orders),
        ];

        overrides
            .into_iter()
            .fold(ConflictPolicy::default(), |policy, (table, strategy)| match strategy {
                Some(strategy) => policy.with(table, strategy),
                None => policy,
            })
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub authority: AuthoritySettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub conflicts: ConflictSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        let base = self.authority.base()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "Authority URL must start with http:// or https://, got: {}",
                self.authority.base_url
            )));
        }

        for endpoint in &self.network.probe_endpoints {
            Url::parse(endpoint)?;
        }

        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.sync.batch_size) {
            return Err(SyncError::InvalidConfig(format!(
                "batch_size must be between {} and {}, got {}",
                MIN_BATCH_SIZE, MAX_BATCH_SIZE, self.sync.batch_size
            )));
        }

        if self.sync.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "interval_secs must be greater than 0".into(),
            ));
        }

        if self.sync.run_budget_secs == 0
            || self.authority.request_timeout_secs == 0
            || self.network.reachability_timeout_secs == 0
            || self.network.link_poll_interval_secs == 0
        {
            return Err(SyncError::InvalidConfig(
                "timeouts and poll intervals must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TILLSYNC_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(url) = std::env::var("TILLSYNC_AUTHORITY_URL") {
            debug!(url = %url, "Overriding authority URL from environment");
            self.authority.base_url = url;
        }

        if let Some(secs) = env_number("TILLSYNC_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = secs;
        }

        if let Some(size) = env_number("TILLSYNC_BATCH_SIZE") {
            self.sync.batch_size = size;
        }

        if let Some(secs) = env_number("TILLSYNC_REACHABILITY_TIMEOUT_SECS") {
            self.network.reachability_timeout_secs = secs;
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tillsync", "tillsync")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    /// Returns the default database path, next to the config file.
    pub fn default_database_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tillsync", "tillsync")
            .map(|dirs| dirs.data_dir().join("tillsync.db"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.sync.run_budget_secs)
    }

    pub fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.network.reachability_timeout_secs)
    }

    pub fn link_poll_interval(&self) -> Duration {
        Duration::from_secs(self.network.link_poll_interval_secs)
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflicts.policy()
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => {
            debug!(key, value = %raw, "Overriding setting from environment");
            Some(value)
        }
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.sync.run_budget_secs, 60);
        assert_eq!(config.network.reachability_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "till-1".to_string();
        config.authority.base_url = "ws://authority.local".to_string();
        assert!(matches!(config.validate(), Err(SyncError::InvalidUrl(_))));

        config.authority.base_url = "not a url".to_string();
        assert!(config.validate().is_err());

        config.authority.base_url = "https://api.example.com".to_string();
        assert!(config.validate().is_ok());

        config.sync.batch_size = 5;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
        config.sync.batch_size = 51;
        assert!(config.validate().is_err());
        config.sync.batch_size = 50;
        assert!(config.validate().is_ok());

        config.sync.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_conflict_overrides_build_policy() {
        let toml_str = r#"
            [device]
            id = "till-1"

            [conflicts]
            products = "merge"
        "#;
        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        let policy = config.conflict_policy();

        assert_eq!(policy.strategy_for(EntityTable::Products), ConflictStrategy::Merge);
        assert_eq!(policy.strategy_for(EntityTable::Sales), ConflictStrategy::LocalWins);
        assert_eq!(
            policy.strategy_for(EntityTable::StockMovements),
            ConflictStrategy::TimestampWins
        );
        assert_eq!(config.sync.batch_size, 25);
    }

    #[test]
    fn test_health_url_joins_paths() {
        let mut authority = AuthoritySettings::default();
        authority.base_url = "https://api.example.com/v1/".into();
        authority.health_path = "/health".into();
        assert_eq!(
            authority.health_url().unwrap().as_str(),
            "https://api.example.com/v1/health"
        );
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.name = "Register 2".into();
        config.conflicts.sales = Some(ConflictStrategy::Merge);
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.name, "Register 2");
        assert_eq!(loaded.conflicts.sales, Some(ConflictStrategy::Merge));
    }

    #[test]
    fn test_toml_serialization() {
        let config = SyncConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[authority]"));
        assert!(toml_str.contains("[sync]"));
    }
}
