//! Core configuration module
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. `XFSYNC_SERVER_URL` overrides `server_url` when set.

use crate::shared::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding [`CoreConfig::server_url`]
pub const SERVER_URL_ENV: &str = "XFSYNC_SERVER_URL";

/// Full configuration of the synchronization core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Remote authority base URL
    pub server_url: Option<String>,
    /// Durable local store
    pub store: StoreConfig,
    /// Sync queue replay
    pub sync: SyncConfig,
    /// Connectivity monitor
    pub connectivity: ConnectivityConfig,
    /// Progressive resource loader
    pub loader: LoaderConfig,
}

/// Durable local store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// TTL applied when a caller does not pick one
    pub default_ttl_secs: u64,
    /// How often expired entries are swept
    pub sweep_interval_secs: u64,
    /// Storage cap in bytes, unlimited when unset
    pub capacity_bytes: Option<u64>,
    /// SQLite file location, platform data dir when unset
    pub database_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 7 * 24 * 60 * 60,
            sweep_interval_secs: 5 * 60,
            capacity_bytes: None,
            database_path: None,
        }
    }
}

impl StoreConfig {
    /// Default TTL as a `Duration`
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Sweep interval as a `Duration`
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Resolve the database path
    ///
    /// Uses the platform data directory when no explicit path is configured.
    pub fn resolved_database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }
        let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        path.push("xfsync");
        path.push("local.db");
        path
    }
}

/// Sync queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay after the first failure
    pub base_delay_ms: u64,
    /// Multiplier applied per further failure
    pub factor: f64,
    /// Upper bound on a single delay
    pub max_delay_ms: u64,
    /// Delivery attempts before an operation is dead-lettered
    pub max_attempts: u32,
    /// Drain automatically on reconnect and after enqueue while online
    pub auto_drain: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 6,
            auto_drain: true,
        }
    }
}

/// Connectivity monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Number of samples in the rolling window
    pub rtt_window: usize,
    /// Average RTT above this is `slow`
    pub slow_rtt_ms: u64,
    /// Average RTT below this is `fast`
    pub fast_rtt_ms: u64,
    /// Average throughput below this forces `slow`
    pub slow_throughput_bps: u64,
    /// Interval between round-trip probes
    pub probe_interval_secs: u64,
    /// Consecutive failed probes treated as a disconnect
    pub probe_failure_threshold: u32,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            rtt_window: 10,
            slow_rtt_ms: 1_500,
            fast_rtt_ms: 300,
            slow_throughput_bps: 64 * 1024,
            probe_interval_secs: 15,
            probe_failure_threshold: 3,
        }
    }
}

/// Progressive loader settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum loads in flight on a normal network
    pub max_concurrent: usize,
    /// Per-item budget on a normal network
    pub timeout_ms: u64,
    /// Scale limits with network quality
    pub adaptive_loading: bool,
    /// How long loaded items stay in the durable cache
    pub cache_ttl_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout_ms: 15_000,
            adaptive_loading: true,
            cache_ttl_secs: 24 * 60 * 60,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::config(err.to_string())
    }
}

impl CoreConfig {
    /// Create a new builder
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Parse from a TOML document and validate
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let mut config: CoreConfig = toml::from_str(source)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.is_empty() {
                self.server_url = Some(url);
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.max_attempts == 0 {
            return Err(invalid("sync.max_attempts", "must be at least 1"));
        }
        if self.sync.factor < 1.0 {
            return Err(invalid("sync.factor", "must be >= 1.0"));
        }
        if self.sync.max_delay_ms < self.sync.base_delay_ms {
            return Err(invalid("sync.max_delay_ms", "must be >= sync.base_delay_ms"));
        }
        if self.loader.max_concurrent == 0 {
            return Err(invalid("loader.max_concurrent", "must be at least 1"));
        }
        if self.loader.timeout_ms == 0 {
            return Err(invalid("loader.timeout_ms", "must be positive"));
        }
        if self.connectivity.rtt_window == 0 {
            return Err(invalid("connectivity.rtt_window", "must be at least 1"));
        }
        if self.connectivity.fast_rtt_ms >= self.connectivity.slow_rtt_ms {
            return Err(invalid(
                "connectivity.fast_rtt_ms",
                "must be below connectivity.slow_rtt_ms",
            ));
        }
        if let Some(url) = &self.server_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid("server_url", format!("not an http(s) URL: {}", url)));
            }
        }
        Ok(())
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        message: message.into(),
    }
}

/// Builder for [`CoreConfig`]
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// Set the server URL
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = Some(url.into());
        self
    }

    /// Set the SQLite path
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store.database_path = Some(path.into());
        self
    }

    /// Cap local storage
    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.config.store.capacity_bytes = Some(bytes);
        self
    }

    /// Set the maximum delivery attempts
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.sync.max_attempts = attempts;
        self
    }

    /// Enable or disable automatic draining
    pub fn auto_drain(mut self, enabled: bool) -> Self {
        self.config.sync.auto_drain = enabled;
        self
    }

    /// Set loader concurrency
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.loader.max_concurrent = max;
        self
    }

    /// Enable or disable adaptive loading
    pub fn adaptive_loading(mut self, enabled: bool) -> Self {
        self.config.loader.adaptive_loading = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<CoreConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
