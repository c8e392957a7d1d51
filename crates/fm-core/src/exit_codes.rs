//! Exit codes for the fuzzermon CLI.
//!
//! Scripts that push batches with `fuzzermon ingest` branch on these instead
//! of parsing output:
//! - 0-9: the command ran; 1 means the batch was rejected as a whole
//! - 10-19: fix the invocation or the config file and retry
//! - 20-29: the database, the filesystem or fuzzermon itself failed

use fm_common::IngestError;

/// Exit codes for fuzzermon operations.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Clean = 0,

    /// A batch was read but rejected; nothing was committed
    IngestRejected = 1,

    /// Invalid arguments
    ArgsError = 10,

    /// Configuration file missing, unreadable or invalid
    ConfigError = 11,

    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,

    /// Database could not be opened, migrated or queried
    StorageError = 22,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    /// Code for a batch that `ingest` did not commit.
    ///
    /// Storage errors are reported apart from batches that will never be
    /// accepted as written.
    pub fn for_ingest_error(error: &IngestError) -> Self {
        match error {
            IngestError::InternalInvariantViolation(_) => ExitCode::InternalError,
            IngestError::StorageConflict { .. } | IngestError::StorageFailure { .. } => {
                ExitCode::StorageError
            }
            _ => ExitCode::IngestRejected,
        }
    }

    pub fn is_user_error(self) -> bool {
        let code = self as i32;
        (10..20).contains(&code)
    }

    pub fn is_internal_error(self) -> bool {
        (self as i32) >= 20
    }

    /// Get the error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::IngestRejected => "ERR_REJECTED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
            ExitCode::StorageError => "ERR_STORAGE",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_consistent() {
        assert!(ExitCode::Clean.is_success());
        assert!(!ExitCode::IngestRejected.is_success());
        assert!(ExitCode::ConfigError.is_user_error());
        assert!(ExitCode::StorageError.is_internal_error());
    }

    #[test]
    fn ingest_errors_map_by_category() {
        assert_eq!(
            ExitCode::for_ingest_error(&IngestError::MissingField("arch".into())),
            ExitCode::IngestRejected
        );
        assert_eq!(
            ExitCode::for_ingest_error(&IngestError::StorageConflict {
                operation: "commit batch".into()
            }),
            ExitCode::StorageError
        );
        assert_eq!(
            ExitCode::for_ingest_error(&IngestError::InternalInvariantViolation("x".into())),
            ExitCode::InternalError
        );
    }

    #[test]
    fn display_includes_name_and_number() {
        assert_eq!(ExitCode::StorageError.to_string(), "ERR_STORAGE (22)");
        assert_eq!(i32::from(ExitCode::ArgsError), 10);
    }
}
