//! Structured event vocabulary for logging.
//!
//! Pipeline code tags its log lines with a [`Stage`] and, for milestones, an
//! `event` field holding one of the [`event_names`] constants. The JSONL layer
//! lifts both into top-level keys so log shippers can filter on them.

use serde::{Deserialize, Serialize};

/// Log levels for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::Trace,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::INFO => Level::Info,
            tracing::Level::WARN => Level::Warn,
            tracing::Level::ERROR => Level::Error,
        }
    }
}

/// Processing stages in fuzzermon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Batch body accepted off the wire.
    Received,
    /// Schema validation and decoding.
    Parsing,
    /// Arch, host and user lookup-or-create.
    Resolving,
    /// Batch, entry and child rows inside the transaction.
    Writing,
    /// Transaction committed.
    Committed,
    /// HTTP server lifecycle.
    Serve,
    /// Dashboard reads.
    Query,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Parsing => "parsing",
            Stage::Resolving => "resolving",
            Stage::Writing => "writing",
            Stage::Committed => "committed",
            Stage::Serve => "serve",
            Stage::Query => "query",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Ingestion lifecycle
    pub const INGEST_RECEIVED: &str = "ingest.received";
    pub const INGEST_COMMITTED: &str = "ingest.committed";
    pub const INGEST_FAILED: &str = "ingest.failed";

    // Entity resolution
    pub const RESOLVE_CREATED: &str = "resolve.created";
    pub const RESOLVE_CONFLICT_RETRY: &str = "resolve.conflict_retry";

    // Server lifecycle
    pub const SERVER_STARTED: &str = "server.started";
    pub const SERVER_STOPPED: &str = "server.stopped";
    pub const REQUEST_FAILED: &str = "server.request_failed";

    // Config
    pub const CONFIG_LOADED: &str = "config.loaded";
    pub const CONFIG_DEFAULT_USED: &str = "config.default_used";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_display_matches_serde() {
        for stage in [
            Stage::Received,
            Stage::Parsing,
            Stage::Resolving,
            Stage::Writing,
            Stage::Committed,
            Stage::Serve,
            Stage::Query,
        ] {
            assert_eq!(
                serde_json::to_string(&stage).unwrap(),
                format!("\"{}\"", stage)
            );
        }
    }

    #[test]
    fn level_from_tracing() {
        assert_eq!(Level::from(tracing::Level::INFO), Level::Info);
        assert_eq!(Level::from(tracing::Level::WARN), Level::Warn);
    }

    #[test]
    fn event_names_are_dotted() {
        assert_eq!(event_names::INGEST_COMMITTED, "ingest.committed");
        assert_eq!(event_names::RESOLVE_CONFLICT_RETRY, "resolve.conflict_retry");
    }
}
