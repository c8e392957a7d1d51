//! Fuzzermon common types, IDs, and errors.
//!
//! This crate provides foundational types shared across fm-core modules:
//! - Storage identity types for every persisted entity
//! - Plain entity records read back by dashboards
//! - The ingestion error taxonomy and its user-visible categories
//! - The structured ingestion outcome returned to fuzzer hosts
//! - Output and numeric display formats

pub mod display;
pub mod error;
pub mod id;
pub mod model;
pub mod outcome;
pub mod output;

pub use display::DisplayMode;
pub use error::{ErrorCategory, FailureCategory, IngestError, Result};
pub use id::{ArchId, BatchId, FailureId, HostId, OpcodeId, SessionId, SignalErrorId, SuccessId, UserId};
pub use model::{
    Arch, BatchRecord, FailureInputRow, FailureStateRow, Host, Opcode, SignalErrorInputRow,
    TestFailureRecord, TestSignalErrorRecord, TestSuccessRecord, User,
};
pub use outcome::IngestOutcome;
pub use output::OutputFormat;
