//! Logging configuration.
//!
//! [`LogConfig`] doubles as the `[logging]` section of `config.toml`.
//! Precedence, lowest to highest: built-in defaults, the config file,
//! environment (`FM_LOG` or `RUST_LOG`, then `FM_LOG_FORMAT`), CLI flags.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console format (default).
    #[default]
    Human,
    /// Machine-parseable JSON lines.
    Jsonl,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "console" | "pretty" => Ok(LogFormat::Human),
            "jsonl" | "json" => Ok(LogFormat::Jsonl),
            other => Err(format!("unknown log format '{}' (expected human or jsonl)", other)),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogFormat::Human => "human",
            LogFormat::Jsonl => "jsonl",
        })
    }
}

/// Log level filter, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    /// Completely silent.
    Off,
}

impl LogLevel {
    const ORDER: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Off,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }

    fn rank(self) -> usize {
        Self::ORDER.iter().position(|l| *l == self).unwrap_or(2)
    }

    /// One step more verbose (`-v`), saturating at trace.
    pub fn louder(self) -> Self {
        Self::ORDER[self.rank().saturating_sub(1)]
    }

    /// One step quieter (`-q`), saturating at off.
    pub fn quieter(self) -> Self {
        Self::ORDER[(self.rank() + 1).min(Self::ORDER.len() - 1)]
    }

    /// The global level of a `RUST_LOG` value, ignoring per-target
    /// directives such as `fm_core::store=trace`.
    fn from_rust_log(value: &str) -> Option<Self> {
        value
            .split(',')
            .filter(|directive| !directive.contains('='))
            .filter_map(|directive| directive.parse().ok())
            .last()
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "warning" => Ok(LogLevel::Warn),
            "none" | "quiet" => Ok(LogLevel::Off),
            _ => Self::ORDER
                .into_iter()
                .find(|level| level.as_str() == s)
                .ok_or_else(|| format!("unknown log level '{}'", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

/// Logging configuration; also the `[logging]` config file section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Whether to include timestamps in human output.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Info,
            format: LogFormat::Human,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Layer the process environment and CLI flags over `base`
    /// (the config file section, or defaults).
    pub fn from_env(
        base: Option<LogConfig>,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        let mut config = base.unwrap_or_default();
        config.apply_env(|name| std::env::var(name).ok());
        if let Some(level) = cli_level {
            config.level = level;
        }
        if let Some(format) = cli_format {
            config.format = format;
        }
        config
    }

    /// Apply `FM_LOG`/`RUST_LOG`/`FM_LOG_FORMAT` as read through `lookup`.
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let level = match lookup("FM_LOG") {
            Some(value) => value.parse().ok(),
            None => lookup("RUST_LOG").and_then(|value| LogLevel::from_rust_log(&value)),
        };
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(format) = lookup("FM_LOG_FORMAT").and_then(|v| v.parse().ok()) {
            self.format = format;
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}
