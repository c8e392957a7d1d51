//! The structured ingestion response.
//!
//! Callers always receive a transport-level success and must inspect the
//! `type` field:
//! ```json
//! {"type": "success"}
//! {"type": "failure", "message": "Invalid key 'arch'"}
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Result of one ingestion call as seen by the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngestOutcome {
    /// The whole batch was committed.
    Success,
    /// Nothing from the batch was committed.
    Failure {
        /// Category prefix plus the offending detail.
        message: String,
    },
}

impl IngestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, IngestOutcome::Success)
    }
}

impl From<&IngestError> for IngestOutcome {
    fn from(err: &IngestError) -> Self {
        IngestOutcome::Failure {
            message: err.user_message(),
        }
    }
}
