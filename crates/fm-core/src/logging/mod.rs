//! Structured logging for fuzzermon.
//!
//! Provides dual-mode logging:
//! - Human-readable console output for interactive use
//! - Machine-parseable JSONL for the long-running server
//!
//! # Usage
//!
//! ```ignore
//! use fm_core::logging::{init_logging, event_names, LogConfig, Stage};
//!
//! let config = LogConfig::from_env(None, None, None);
//! init_logging(&config);
//!
//! tracing::info!(
//!     event = event_names::SERVER_STARTED,
//!     stage = %Stage::Serve,
//!     "listening"
//! );
//! ```
//!
//! stdout is reserved for command payloads (outcomes, summaries, schemas);
//! all log output goes to stderr.

pub mod config;
pub mod events;
pub mod layer;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, Level, Stage};
pub use layer::JsonlLayer;

use std::io::IsTerminal;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem.
///
/// Must be called once at startup before any logging occurs. A second call
/// is a no-op. `RUST_LOG` directives, when present, replace the level filter
/// entirely.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(config.level).into())
        .from_env_lossy();

    let result = match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(use_ansi);

            if config.timestamps {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => tracing_subscriber::registry()
            .with(filter)
            .with(JsonlLayer::stderr())
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

/// Generate a correlation id for one ingestion.
pub fn generate_ingest_id() -> String {
    format!("ing-{}", uuid::Uuid::new_v4().simple())
}

/// Shorten a possibly long string for a log field.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ingest_id() {
        let a = generate_ingest_id();
        let b = generate_ingest_id();
        assert!(a.starts_with("ing-"));
        assert_eq!(a.len(), 4 + 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncate_short() {
        assert_eq!(truncate_for_log("short", 10), "short");
    }

    #[test]
    fn test_truncate_long_respects_char_boundary() {
        let s = "ééééé";
        let out = truncate_for_log(s, 3);
        assert!(out.starts_with('é'));
        assert!(out.ends_with("...(truncated)"));
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        let config = LogConfig::default().with_level(LogLevel::Off);
        init_logging(&config);
        init_logging(&config);
    }
}
