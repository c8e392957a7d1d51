//! Storage identity types.
//!
//! Every persisted row is addressed by a store-generated integer identity.
//! Each entity gets its own newtype so a host id can never be passed where an
//! opcode id is expected. Natural keys (names, hostnames) are plain strings
//! and live on the records in [`crate::model`].

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                $name(id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>().map($name)
            }
        }
    };
}

row_id!(
    /// Identity of an architecture row.
    ArchId
);
row_id!(
    /// Identity of a testing host row.
    HostId
);
row_id!(
    /// Identity of a fuzzer operator row.
    UserId
);
row_id!(
    /// Identity of an opcode row (scoped to one architecture).
    OpcodeId
);
row_id!(
    /// Identity of an uploaded batch.
    BatchId
);
row_id!(
    /// Identity of a collapsed success record.
    SuccessId
);
row_id!(
    /// Identity of a semantic-mismatch failure record.
    FailureId
);
row_id!(
    /// Identity of an unexpected-signal record.
    SignalErrorId
);

/// Dashboard session identifier, carried in a cookie.
///
/// Format: `fm-` followed by a hyphenated UUIDv4.
/// Example: `fm-1b4e28ba-2fa1-41d2-883f-0016d3cca427`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    const PREFIX: &'static str = "fm-";

    /// Generate a new session ID.
    pub fn new() -> Self {
        SessionId(format!("{}{}", Self::PREFIX, uuid::Uuid::new_v4()))
    }

    /// Parse an existing session ID string, rejecting anything not minted by
    /// [`SessionId::new`].
    pub fn parse(s: &str) -> Option<Self> {
        let raw = s.strip_prefix(Self::PREFIX)?;
        uuid::Uuid::parse_str(raw).ok()?;
        Some(SessionId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
