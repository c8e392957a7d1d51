//! Plain entity records.
//!
//! These mirror the relational model row for row. They carry no behavior and
//! no connection to the store; fm-core reads and writes them explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{
    ArchId, BatchId, FailureId, HostId, OpcodeId, SignalErrorId, SuccessId, UserId,
};

/// An instruction set architecture. `name` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arch {
    pub id: ArchId,
    pub name: String,
}

/// A testing machine. `hostname` is unique; `arch_id` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub hostname: String,
    pub arch_id: ArchId,
}

/// A fuzzer operator. `username` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// An instruction mnemonic, unique per (name, arch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opcode {
    pub id: OpcodeId,
    pub name: String,
    pub arch_id: ArchId,
}

/// One upload. `fuzzer_host` is free text, not a [`Host`] reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub testing_host_id: HostId,
    pub fuzzer_host: String,
    pub user_id: UserId,
    pub submitted_at: DateTime<Utc>,
}

/// `count` successful trials of one opcode, collapsed into a single row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuccessRecord {
    pub id: SuccessId,
    pub batch_id: BatchId,
    pub opcode_id: OpcodeId,
    pub count: u64,
}

/// A semantic mismatch between expected and observed machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailureRecord {
    pub id: FailureId,
    pub batch_id: BatchId,
    pub opcode_id: OpcodeId,
    pub pretty: String,
    pub bytes: String,
    pub arguments: String,
}

/// A location whose observed value differed from the expected one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStateRow {
    pub location: String,
    pub expected_value: String,
    pub actual_value: String,
}

/// An input location/value that produced a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInputRow {
    pub location: String,
    pub value: String,
}

/// An instruction that crashed the test harness with a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSignalErrorRecord {
    pub id: SignalErrorId,
    pub batch_id: BatchId,
    pub opcode_id: OpcodeId,
    pub pretty: String,
    pub bytes: String,
    pub signal: i64,
}

/// An input location/value that produced a signal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalErrorInputRow {
    pub location: String,
    pub value: String,
}
