//! Bootstrap configuration loading and logging initialisation
//!
//! Configuration sources, highest priority first:
//! 1. Command-line argument (`--config <path>`)
//! 2. `TROVE_CONFIG` environment variable
//! 3. User config file (`~/.config/trove/config.toml` on Linux)
//! 4. Compiled defaults
//!
//! A missing or unreadable config file is never fatal: a warning is logged and
//! the compiled defaults are used.

use crate::time::secs_to_duration;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "TROVE_CONFIG";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metadata engine tuning (optional)
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Metadata engine configuration
///
/// Every field has a built-in default so a partial `[engine]` table is valid.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Consecutive failures before a provider circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before admitting a half-open probe
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Concurrent in-flight calls allowed per provider
    #[serde(default = "default_per_provider_concurrency")]
    pub per_provider_concurrency: usize,

    /// Fields of one resolution request resolved concurrently
    #[serde(default = "default_max_concurrent_fields")]
    pub max_concurrent_fields: usize,

    /// Cache TTL used when neither provider nor field declares one
    #[serde(default = "default_cache_ttl_secs")]
    pub default_cache_ttl_secs: u64,

    /// Serve expired cache entries while refreshing them in the background
    #[serde(default)]
    pub stale_while_revalidate: bool,

    /// How long past expiry an entry is still retained for stale serving
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,

    /// Plugin version records retained per provider for rollback
    #[serde(default = "default_version_retention")]
    pub version_retention: usize,

    /// Timeout for the post-update health probe
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Update channel consulted by plugin updates
    #[serde(default = "default_update_channel")]
    pub update_channel: String,

    /// Directory where plugin artifacts are staged
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// SQLite database for persisted engine state
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Event bus channel capacity
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_per_provider_concurrency() -> usize {
    4
}

fn default_max_concurrent_fields() -> usize {
    8
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_stale_grace_secs() -> u64 {
    60 * 60
}

fn default_version_retention() -> usize {
    3
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_update_channel() -> String {
    "stable".to_string()
}

fn default_event_capacity() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            per_provider_concurrency: default_per_provider_concurrency(),
            max_concurrent_fields: default_max_concurrent_fields(),
            default_cache_ttl_secs: default_cache_ttl_secs(),
            stale_while_revalidate: false,
            stale_grace_secs: default_stale_grace_secs(),
            version_retention: default_version_retention(),
            probe_timeout_secs: default_probe_timeout_secs(),
            update_channel: default_update_channel(),
            staging_dir: None,
            database_path: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn cooldown(&self) -> Duration {
        secs_to_duration(self.cooldown_secs)
    }

    pub fn default_cache_ttl(&self) -> Duration {
        secs_to_duration(self.default_cache_ttl_secs)
    }

    pub fn stale_grace(&self) -> Duration {
        secs_to_duration(self.stale_grace_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        secs_to_duration(self.probe_timeout_secs)
    }

    /// Staging directory, falling back to the platform data directory
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("plugins"))
    }

    /// Validate values that have no meaningful zero
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be at least 1".to_string()));
        }
        if self.per_provider_concurrency == 0 {
            return Err(Error::Config(
                "per_provider_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_fields == 0 {
            return Err(Error::Config("max_concurrent_fields must be at least 1".to_string()));
        }
        if self.version_retention == 0 {
            return Err(Error::Config("version_retention must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl TomlConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }
}

/// Resolves which config file to use and loads it with graceful fallback
pub struct ConfigResolver {
    cli_path: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new(cli_path: Option<PathBuf>) -> Self {
        Self { cli_path }
    }

    /// Locate the config file following the priority order
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            return Some(path.clone());
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        dirs::config_dir()
            .map(|d| d.join("trove").join("config.toml"))
            .filter(|p| p.exists())
    }

    /// Load the resolved config, or compiled defaults when none is usable
    ///
    /// An explicitly requested file that fails to parse is still an error;
    /// only absence degrades to defaults.
    pub fn load(&self) -> Result<TomlConfig> {
        let Some(path) = self.locate() else {
            info!("No config file found, using compiled defaults");
            return Ok(TomlConfig::default());
        };

        if !path.exists() {
            warn!("Config file {} not found, using compiled defaults", path.display());
            return Ok(TomlConfig::default());
        }

        info!("Loading config from {}", path.display());
        TomlConfig::load(&path)
    }
}

/// OS-dependent default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("trove"))
        .unwrap_or_else(|| PathBuf::from("./trove_data"))
}

/// Initialise the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", logging.level, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| Error::Internal(format!("Tracing already initialised: {}", e)))
}
