//! In-memory representation of an uploaded test batch.
//!
//! A batch document looks like:
//! ```json
//! {
//!   "fuzzer-host": "fh1",
//!   "fuzzer-user": "u1",
//!   "testing-host": "th1",
//!   "arch": "x86",
//!   "entries": [
//!     {"type": "success", "opcode": "ADD", "count": 5},
//!     {"type": "failure", "opcode": "SUB", "raw-operands": "...", "pretty": "...",
//!      "bytes": "...", "state": [{"location": "r1", "expected": "1", "actual": "2"}],
//!      "inputs": [{"location": "r1", "value": "0"}]},
//!     {"type": "unexpectedSignal", "opcode": "LDR", "pretty": "...", "bytes": "...",
//!      "signal": 11, "inputs": []}
//!   ]
//! }
//! ```
//!
//! Decoding lives in [`parse`]. The types here serialize back to exactly this
//! wire shape, so `parse_batch(serde_json::to_vec(&b)) == b`.

pub mod parse;

pub use parse::parse_batch;

use schemars::JsonSchema;
use serde::Serialize;

/// A decoded upload from one fuzzer host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct Batch {
    /// Machine that generated the fuzz inputs. Not necessarily registered.
    #[serde(rename = "fuzzer-host")]
    pub fuzzer_host: String,
    /// Operator who ran the fuzzer.
    #[serde(rename = "fuzzer-user")]
    pub fuzzer_user: String,
    /// Machine that executed the instructions.
    #[serde(rename = "testing-host")]
    pub testing_host: String,
    pub arch: String,
    pub entries: Vec<BatchEntry>,
}

/// One instruction-level result. Exactly three kinds exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(tag = "type")]
pub enum BatchEntry {
    #[serde(rename = "success")]
    Success(SuccessEntry),
    #[serde(rename = "failure")]
    Failure(FailureEntry),
    #[serde(rename = "unexpectedSignal")]
    UnexpectedSignal(SignalEntry),
}

impl BatchEntry {
    pub fn opcode(&self) -> &str {
        match self {
            BatchEntry::Success(e) => &e.opcode,
            BatchEntry::Failure(e) => &e.opcode,
            BatchEntry::UnexpectedSignal(e) => &e.opcode,
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            BatchEntry::Success(_) => EntryKind::Success,
            BatchEntry::Failure(_) => EntryKind::Failure,
            BatchEntry::UnexpectedSignal(_) => EntryKind::UnexpectedSignal,
        }
    }
}

/// `count` passing trials of one opcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct SuccessEntry {
    pub opcode: String,
    pub count: u64,
}

/// A semantic mismatch: the instruction ran but produced the wrong state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct FailureEntry {
    pub opcode: String,
    #[serde(rename = "raw-operands")]
    pub raw_operands: String,
    pub pretty: String,
    pub bytes: String,
    pub state: Vec<StateValue>,
    pub inputs: Vec<Input>,
}

/// The instruction crashed the harness with `signal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct SignalEntry {
    pub opcode: String,
    pub pretty: String,
    pub bytes: String,
    pub signal: i64,
    pub inputs: Vec<Input>,
}

/// Expected and observed value at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct StateValue {
    pub location: String,
    pub expected: String,
    pub actual: String,
}

/// One input location and the value it was seeded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct Input {
    pub location: String,
    pub value: String,
}

/// Discriminant of [`BatchEntry`], matching the wire `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Success,
    Failure,
    UnexpectedSignal,
}

impl EntryKind {
    pub const ALL: [EntryKind; 3] = [
        EntryKind::Success,
        EntryKind::Failure,
        EntryKind::UnexpectedSignal,
    ];

    /// The wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Success => "success",
            EntryKind::Failure => "failure",
            EntryKind::UnexpectedSignal => "unexpectedSignal",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        EntryKind::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
