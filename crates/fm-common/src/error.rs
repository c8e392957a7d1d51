//! Error types for batch ingestion.
//!
//! Every failure in the ingestion pipeline is an [`IngestError`]. Errors carry:
//! - A stable numeric code for machine parsing
//! - An internal category used for logging and metrics
//! - A user-visible [`FailureCategory`] that decides the response prefix
//! - A retryability hint (only storage conflicts are retried)
//!
//! # Response messages
//!
//! Fuzzer hosts only ever see [`IngestError::user_message`], which is built
//! from the category prefix and the error's display string:
//! ```text
//! Type error: field 'entries' must be an array, got a string
//! Invalid key 'fuzzer-host'
//! Invalid value: invalid batch entry type: crashed
//! Error: storage failure during insert batch
//! ```
//! Storage failures keep their driver detail in [`IngestError::detail`] for
//! logs; it never reaches the response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Internal error categories for grouping related errors in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The payload could not be decoded or failed schema validation.
    Schema,
    /// The persistent store rejected or failed an operation.
    Storage,
    /// A condition the pipeline guarantees never happens.
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Schema => write!(f, "schema"),
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// User-visible failure categories reported in ingestion responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// A field had the wrong JSON type.
    TypeError,
    /// A required key was absent.
    InvalidKey,
    /// A value failed domain validation.
    InvalidValue,
    /// Anything else.
    Error,
}

impl FailureCategory {
    /// Stable label, used as a metrics dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::TypeError => "type_error",
            FailureCategory::InvalidKey => "invalid_key",
            FailureCategory::InvalidValue => "invalid_value",
            FailureCategory::Error => "error",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for the ingestion pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    // Schema errors (10-19)
    #[error("malformed batch document: {0}")]
    MalformedDocument(String),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' must be {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid batch entry type: {0}")]
    InvalidEntryType(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    // Storage errors (20-29)
    #[error("storage conflict during {operation}")]
    StorageConflict { operation: String },

    #[error("storage failure during {operation}")]
    StorageFailure { operation: String, detail: String },

    // Internal errors (30-39)
    #[error("BUG: {0}")]
    InternalInvariantViolation(String),
}

impl IngestError {
    /// Shorthand for a [`IngestError::TypeMismatch`].
    pub fn type_mismatch(
        field: impl Into<String>,
        expected: &'static str,
        actual: &'static str,
    ) -> Self {
        IngestError::TypeMismatch {
            field: field.into(),
            expected,
            actual,
        }
    }

    /// Shorthand for a [`IngestError::InvalidValue`].
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns the error code for this error type.
    ///
    /// Error codes are stable and grouped by category:
    /// - 10-19: Schema errors
    /// - 20-29: Storage errors
    /// - 30-39: Internal errors
    pub fn code(&self) -> u32 {
        match self {
            IngestError::MalformedDocument(_) => 10,
            IngestError::MissingField(_) => 11,
            IngestError::TypeMismatch { .. } => 12,
            IngestError::InvalidEntryType(_) => 13,
            IngestError::InvalidValue { .. } => 14,
            IngestError::StorageConflict { .. } => 20,
            IngestError::StorageFailure { .. } => 21,
            IngestError::InternalInvariantViolation(_) => 30,
        }
    }

    /// Returns the internal category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::MalformedDocument(_)
            | IngestError::MissingField(_)
            | IngestError::TypeMismatch { .. }
            | IngestError::InvalidEntryType(_)
            | IngestError::InvalidValue { .. } => ErrorCategory::Schema,

            IngestError::StorageConflict { .. } | IngestError::StorageFailure { .. } => {
                ErrorCategory::Storage
            }

            IngestError::InternalInvariantViolation(_) => ErrorCategory::Internal,
        }
    }

    /// Returns the category reported to the submitter.
    ///
    /// An undecodable document counts as an invalid value, the same bucket a
    /// rejected entry type or count lands in.
    pub fn failure_category(&self) -> FailureCategory {
        match self {
            IngestError::TypeMismatch { .. } => FailureCategory::TypeError,
            IngestError::MissingField(_) => FailureCategory::InvalidKey,
            IngestError::MalformedDocument(_)
            | IngestError::InvalidEntryType(_)
            | IngestError::InvalidValue { .. } => FailureCategory::InvalidValue,
            IngestError::StorageConflict { .. }
            | IngestError::StorageFailure { .. }
            | IngestError::InternalInvariantViolation(_) => FailureCategory::Error,
        }
    }

    /// Whether the operation may succeed if simply repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::StorageConflict { .. })
    }

    /// Driver-level detail for logs. Never part of a response.
    pub fn detail(&self) -> Option<&str> {
        match self {
            IngestError::StorageFailure { detail, .. } => Some(detail),
            _ => None,
        }
    }

    /// The short human-readable message returned to the submitter.
    pub fn user_message(&self) -> String {
        match self.failure_category() {
            FailureCategory::TypeError => format!("Type error: {}", self),
            FailureCategory::InvalidKey => match self {
                IngestError::MissingField(name) => format!("Invalid key '{}'", name),
                other => format!("Invalid key: {}", other),
            },
            FailureCategory::InvalidValue => format!("Invalid value: {}", self),
            FailureCategory::Error => format!("Error: {}", self),
        }
    }
}
