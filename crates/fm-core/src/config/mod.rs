//! Configuration loading and validation for fuzzermon.
//!
//! This module handles:
//! - Loading `config.toml` (resolution order: CLI > env > XDG > defaults)
//! - Schema validation (shape/type checking via serde)
//! - Semantic validation (ports, worker counts, limits)
//! - Command-line overrides for the few settings operators change often

pub mod validation;

pub use validation::{validate_config, ValidationError};

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogConfig;

/// Default XDG config directory name.
const CONFIG_DIR_NAME: &str = "fuzzermon";

/// File name looked up inside the config directory.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "FUZZERMON_CONFIG";

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid TOML in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Semantic validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct FuzzermonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
    pub logging: LogConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind: String,
    pub port: u16,
    /// Request worker threads, each with its own database connection.
    pub workers: usize,
    /// Upload bodies larger than this are rejected unread.
    pub max_body_bytes: u64,
    /// Cookie carrying the dashboard session id.
    pub session_cookie: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            workers: 4,
            max_body_bytes: 16 * 1024 * 1024,
            session_cookie: "fm_session".to_string(),
        }
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database: PathBuf,
    /// How long a statement waits on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database: default_database_path(),
            busy_timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// `[metrics]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Route serving the Prometheus text format.
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            path: "/metrics".to_string(),
        }
    }
}

impl FuzzermonConfig {
    /// Address the server binds to. Only valid after validation.
    pub fn socket_addr(&self) -> Result<SocketAddr, ValidationError> {
        validation::parse_socket_addr(&self.server.bind, self.server.port)
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(bind) = &overrides.bind {
            self.server.bind = bind.clone();
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(workers) = overrides.workers {
            self.server.workers = workers;
        }
        if let Some(database) = &overrides.database {
            self.storage.database = database.clone();
        }
    }
}

/// Settings that CLI flags may override.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub database: Option<PathBuf>,
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Flag,
    Env,
    Xdg,
    Defaults,
}

/// Resolved configuration with provenance information.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: FuzzermonConfig,
    /// Path to the config file (None if using defaults).
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config file (highest priority).
    pub config_path: Option<PathBuf>,
    /// Directory searched instead of the XDG config dir. Used by tests.
    pub config_dir: Option<PathBuf>,
}

/// Load configuration with the standard resolution order.
///
/// Resolution order (highest to lowest priority):
/// 1. Explicit `--config` flag
/// 2. Environment variable (FUZZERMON_CONFIG)
/// 3. XDG config home (~/.config/fuzzermon/config.toml)
/// 4. Built-in defaults
///
/// A file named by 1 or 2 must exist; a missing XDG file means defaults.
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    if let Some(path) = &options.config_path {
        return load_required(path, ConfigSource::Flag);
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return load_required(Path::new(&path), ConfigSource::Env);
        }
    }

    if let Some(path) = default_config_path(options) {
        if path.exists() {
            let config = load_from_file(&path)?;
            return Ok(ResolvedConfig {
                config,
                path: Some(path),
                source: ConfigSource::Xdg,
            });
        }
    }

    Ok(ResolvedConfig {
        config: FuzzermonConfig::default(),
        path: None,
        source: ConfigSource::Defaults,
    })
}

fn load_required(path: &Path, source: ConfigSource) -> Result<ResolvedConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    Ok(ResolvedConfig {
        config: load_from_file(path)?,
        path: Some(path.to_path_buf()),
        source,
    })
}

fn default_config_path(options: &ConfigOptions) -> Option<PathBuf> {
    let dir = match &options.config_dir {
        Some(dir) => dir.clone(),
        None => dirs::config_dir()?.join(CONFIG_DIR_NAME),
    };
    Some(dir.join(CONFIG_FILE_NAME))
}

/// Parse a config file. Semantic validation is separate.
pub fn load_from_file(path: &Path) -> Result<FuzzermonConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_config(&content).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn parse_config(content: &str) -> Result<FuzzermonConfig, toml::de::Error> {
    toml::from_str(content)
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join("fuzzermon.db"))
        .unwrap_or_else(|| PathBuf::from("fuzzermon.db"))
}
