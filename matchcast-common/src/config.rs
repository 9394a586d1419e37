//! Configuration loading and config file resolution

use crate::schedule::CalendarSchedule;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "MATCHCAST_CONFIG";

/// HTTP/WebSocket listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 5780,
        }
    }
}

/// Record store location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; `None` uses [`default_database_path`]
    pub path: Option<PathBuf>,
}

/// Per-connection push channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Outbound events buffered per connection before it is considered stalled
    pub outbound_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
        }
    }
}

/// External scorer invocation
///
/// The topic identifier is appended after `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            command: "python".to_string(),
            args: vec!["realtime_predictor.py".to_string()],
            timeout_secs: 120,
        }
    }
}

/// Scheduled retraining job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    /// Cron expression in UTC: five classic fields (day-of-week 0-7, Sunday
    /// is 0 or 7) or six with a leading seconds column (day-of-week 1-7,
    /// Sunday is 1)
    pub schedule: String,
    pub command: String,
    pub args: Vec<String>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 0 * * *".to_string(),
            command: "python".to_string(),
            args: vec!["model_trainer.py".to_string()],
        }
    }
}

/// Logging settings (RUST_LOG takes precedence when set)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete service configuration as read from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub channel: ChannelConfig,
    pub scorer: ScorerConfig,
    pub maintenance: MaintenanceConfig,
    pub logging: LoggingConfig,
}

impl TomlConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TomlConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.scorer.command.trim().is_empty() {
            return Err(Error::Config("scorer.command must not be empty".to_string()));
        }
        if self.scorer.timeout_secs == 0 {
            return Err(Error::Config("scorer.timeout_secs must be positive".to_string()));
        }
        if self.channel.outbound_buffer == 0 {
            return Err(Error::Config(
                "channel.outbound_buffer must be positive".to_string(),
            ));
        }
        if self.maintenance.enabled {
            if self.maintenance.command.trim().is_empty() {
                return Err(Error::Config(
                    "maintenance.command must not be empty".to_string(),
                ));
            }
            CalendarSchedule::parse(&self.maintenance.schedule)
                .map_err(|e| Error::Config(format!("maintenance.schedule: {}", e)))?;
        }
        Ok(())
    }

    /// Database file, falling back to the platform default
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(default_database_path)
    }
}

/// Where the config file came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// `--config` argument
    CommandLine(PathBuf),
    /// MATCHCAST_CONFIG environment variable
    Environment(PathBuf),
    /// Platform config directory
    DefaultLocation(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CommandLine(p)
            | ConfigSource::Environment(p)
            | ConfigSource::DefaultLocation(p) => p,
        }
    }

    /// Explicitly named files must exist; the default location is optional
    pub fn is_explicit(&self) -> bool {
        !matches!(self, ConfigSource::DefaultLocation(_))
    }
}

/// Config file resolution in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform config directory (`<config_dir>/matchcast/config.toml`)
pub fn resolve_config_source(cli_arg: Option<&Path>) -> Option<ConfigSource> {
    if let Some(path) = cli_arg {
        return Some(ConfigSource::CommandLine(path.to_path_buf()));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(ConfigSource::Environment(PathBuf::from(path)));
        }
    }

    default_config_path().map(ConfigSource::DefaultLocation)
}

/// Configuration together with how it was found
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: TomlConfig,
    /// File the configuration was read from; `None` when defaults apply
    pub source: Option<PathBuf>,
    /// Non-fatal problems, reported once logging is up
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    fn defaults(warning: String) -> Self {
        Self {
            config: TomlConfig::default(),
            source: None,
            warnings: vec![warning],
        }
    }
}

/// Load configuration, degrading to compiled defaults when no file exists
///
/// A missing file at the default location yields defaults plus a warning.
/// A missing or malformed explicitly named file is an error.
pub fn load_config(cli_arg: Option<&Path>) -> Result<LoadedConfig> {
    let Some(source) = resolve_config_source(cli_arg) else {
        return Ok(LoadedConfig::defaults(
            "No config directory for this platform, using defaults".to_string(),
        ));
    };

    let path = source.path();
    if !path.exists() {
        if source.is_explicit() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        return Ok(LoadedConfig::defaults(format!(
            "Config file {} not found, using defaults",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    config.validate()?;

    Ok(LoadedConfig {
        config,
        source: Some(path.to_path_buf()),
        warnings: Vec::new(),
    })
}

/// Get default configuration file path for the platform
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("matchcast").join("config.toml"))
}

/// Get OS-dependent default database path
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("matchcast"))
        .unwrap_or_else(|| PathBuf::from("./matchcast_data"))
        .join("matchcast.db")
}
