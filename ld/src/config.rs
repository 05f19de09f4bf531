//! Daemon configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend
    pub storage: StorageConfig,

    /// Lease durations
    pub lease: LeaseConfig,

    /// Recovery loop
    pub scanner: ScannerConfig,

    /// Unix socket API
    pub ipc: IpcConfig,

    /// Client-side retry of transient failures
    pub retry: RetryConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.scanner.interval_secs == 0 {
            return Err(eyre::eyre!("scanner.interval-secs must be greater than zero"));
        }
        if self.lease.default_duration_secs == 0 {
            return Err(eyre::eyre!("lease.default-duration-secs must be greater than zero"));
        }
        if self.lease.default_duration_secs > self.lease.max_duration_secs {
            return Err(eyre::eyre!(
                "lease.default-duration-secs ({}) exceeds lease.max-duration-secs ({})",
                self.lease.default_duration_secs,
                self.lease.max_duration_secs
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: ./leased.yml
        let local_config = PathBuf::from("leased.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/leased/leased.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("leased").join("leased.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Which backend holds the entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: Backend,

    /// SQLite database file
    pub path: PathBuf,

    /// How long a write waits on a locked database before reporting it unavailable
    #[serde(rename = "busy-timeout-ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: data_dir().join("store.db"),
            busy_timeout_ms: 250,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Lease duration limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Used when a request does not name a duration
    #[serde(rename = "default-duration-secs")]
    pub default_duration_secs: u64,

    /// Longest lease a client may ask for
    #[serde(rename = "max-duration-secs")]
    pub max_duration_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_duration_secs: leasestore::DEFAULT_LEASE_SECS,
            max_duration_secs: 3600,
        }
    }
}

impl LeaseConfig {
    /// Resolve a requested duration against the configured default and cap
    pub fn duration(&self, requested_secs: Option<u64>) -> Result<Duration, String> {
        let secs = requested_secs.unwrap_or(self.default_duration_secs);
        if secs == 0 {
            return Err("lease duration must be greater than zero".to_string());
        }
        if secs > self.max_duration_secs {
            return Err(format!(
                "lease duration {}s exceeds maximum {}s",
                secs, self.max_duration_secs
            ));
        }
        Ok(Duration::from_secs(secs))
    }
}

/// Recovery loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub enabled: bool,

    /// Seconds between recovery passes
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
        }
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Unix socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    #[serde(rename = "socket-path")]
    pub socket_path: PathBuf,

    /// Client connect/read timeout
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: crate::ipc::get_socket_path(),
            timeout_ms: 5000,
        }
    }
}

impl IpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backoff for retrying `StoreUnavailable`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "initial-interval-ms")]
    pub initial_interval_ms: u64,

    /// Give up after this long
    #[serde(rename = "max-elapsed-ms")]
    pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 50,
            max_elapsed_ms: 2000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> backoff::ExponentialBackoff {
        let mut backoff = backoff::ExponentialBackoff::default();
        backoff.initial_interval = Duration::from_millis(self.initial_interval_ms);
        backoff.current_interval = backoff.initial_interval;
        backoff.max_elapsed_time = Some(Duration::from_millis(self.max_elapsed_ms));
        backoff
    }
}

/// Base directory for daemon data and logs
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("leased")
}
