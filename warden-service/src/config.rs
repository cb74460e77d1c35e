//! Service configuration loading
//!
//! Loads configuration from `~/.config/warden/warden.toml` (or `WARDEN_CONFIG` env).
//! A missing file yields defaults for every field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use warden_core::{CommandPolicy, ManagerOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {message}")]
    Invalid { message: String },

    #[error("config error: {message}")]
    Source {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Source {
            message: message.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration for the Warden service
#[derive(Debug, Deserialize, Clone)]
pub struct WardenConfig {
    /// Unix socket to listen on; defaults to `$XDG_RUNTIME_DIR/warden.sock`
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Default `tracing` filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON directory snapshot (identities, zones, access points, templates)
    #[serde(default)]
    pub directory_path: Option<String>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub bulk: BulkConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub doors: DoorsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local; state is lost on restart
    Memory,
    Sqlite,
}

/// Ledger settings
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// SQLite database path (`~/` is expanded)
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_db_path() -> String {
    "~/.local/share/warden/warden.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            db_path: default_db_path(),
        }
    }
}

/// Bulk mutation settings
#[derive(Debug, Deserialize, Clone)]
pub struct BulkConfig {
    /// Parallel write workers for non-atomic bulk operations
    #[serde(default = "default_bulk_workers")]
    pub workers: usize,
}

fn default_bulk_workers() -> usize {
    4
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            workers: default_bulk_workers(),
        }
    }
}

/// Change notification bus settings
#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Per-subscriber broadcast buffer
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,

    /// Batches kept for lagging or reconnecting subscribers
    #[serde(default = "default_replay_window")]
    pub replay_window: usize,
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_replay_window() -> usize {
    4096
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
            replay_window: default_replay_window(),
        }
    }
}

/// Door controller command settings
#[derive(Debug, Deserialize, Clone)]
pub struct DoorsConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_heartbeat_stale_after_ms")]
    pub heartbeat_stale_after_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    2_000
}
fn default_max_attempts() -> usize {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    2_000
}
fn default_max_in_flight() -> usize {
    64
}
fn default_heartbeat_stale_after_ms() -> u64 {
    30_000
}

impl Default for DoorsConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_in_flight: default_max_in_flight(),
            heartbeat_stale_after_ms: default_heartbeat_stale_after_ms(),
        }
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            log_level: default_log_level(),
            directory_path: None,
            storage: StorageConfig::default(),
            bulk: BulkConfig::default(),
            bus: BusConfig::default(),
            doors: DoorsConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "WARDEN_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "warden.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `WARDEN_CONFIG` environment variable
    /// 2. `~/.config/warden/warden.toml`
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "Warden config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::with_source(format!("failed to read config at {}", path.display()), e)
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: WardenConfig = toml::from_str(contents)
            .map_err(|e| ConfigError::with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("warden")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    fn validate(&self) -> Result<()> {
        if self.bulk.workers == 0 {
            return Err(ConfigError::invalid("bulk.workers must be at least 1"));
        }
        if self.bus.capacity == 0 {
            return Err(ConfigError::invalid("bus.capacity must be at least 1"));
        }
        if self.doors.max_attempts == 0 {
            return Err(ConfigError::invalid("doors.max_attempts must be at least 1"));
        }
        if self.doors.max_in_flight == 0 {
            return Err(ConfigError::invalid("doors.max_in_flight must be at least 1"));
        }

        if self.bus.replay_window < self.bus.capacity {
            tracing::warn!(
                replay_window = self.bus.replay_window,
                capacity = self.bus.capacity,
                "Replay window smaller than bus capacity; lagging subscribers may lose batches"
            );
        }
        if self.doors.initial_backoff_ms > self.doors.max_backoff_ms {
            tracing::warn!(
                initial = self.doors.initial_backoff_ms,
                max = self.doors.max_backoff_ms,
                "Initial door backoff exceeds max backoff"
            );
        }
        if self.storage.backend == StorageBackend::Memory {
            tracing::warn!("Memory storage backend: grants and audit are lost on restart");
        }

        Ok(())
    }

    /// Get the resolved database path (expanding ~ if needed)
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_home(&self.storage.db_path)
    }

    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(crate::default_socket_path)
    }

    pub fn resolved_directory_path(&self) -> Option<PathBuf> {
        self.directory_path.as_deref().map(expand_home)
    }

    pub fn command_policy(&self) -> CommandPolicy {
        CommandPolicy {
            attempt_timeout: Duration::from_millis(self.doors.command_timeout_ms),
            max_attempts: self.doors.max_attempts,
            initial_backoff: Duration::from_millis(self.doors.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.doors.max_backoff_ms),
            max_in_flight: self.doors.max_in_flight,
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            bulk_workers: self.bulk.workers,
            bus_capacity: self.bus.capacity,
            replay_window: self.bus.replay_window,
            command_policy: self.command_policy(),
            heartbeat_stale_after: Duration::from_millis(self.doors.heartbeat_stale_after_ms),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(path)
}
