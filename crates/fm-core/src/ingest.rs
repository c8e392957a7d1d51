//! The ingestion endpoint: parse, resolve, write, commit.
//!
//! ```text
//! Received -> Parsing -> Resolving -> Writing -> Committed
//!     \__________\___________\___________\______> Failed(stage, error)
//! ```
//!
//! Arch, Host and User are resolved in autocommit mode before the write
//! transaction opens, so they may outlive a batch that later fails. Everything
//! owned by the batch (the batch row, opcodes first seen in it, entries and
//! their children) is written inside one IMMEDIATE transaction. Any error
//! drops the transaction, which rolls it back: a failed batch leaves no rows
//! behind.

use std::time::Instant;

use chrono::{DateTime, Utc};
use fm_common::{Arch, Host, IngestError, IngestOutcome, User};
use rusqlite::TransactionBehavior;
use tracing::{field, info, info_span, warn};

use crate::batch::{parse_batch, Batch};
use crate::logging::{event_names, generate_ingest_id, Stage};
use crate::store::{resolve, storage_error, BatchWriter, ResolvedRefs, Store, WriteSummary};

/// Where an ingestion was when it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Parsing,
    Resolving,
    Writing,
    Committed,
}

impl IngestStage {
    pub fn as_stage(self) -> Stage {
        match self {
            IngestStage::Received => Stage::Received,
            IngestStage::Parsing => Stage::Parsing,
            IngestStage::Resolving => Stage::Resolving,
            IngestStage::Writing => Stage::Writing,
            IngestStage::Committed => Stage::Committed,
        }
    }
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_stage().fmt(f)
    }
}

/// A committed batch.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub ingest_id: String,
    pub arch: String,
    pub summary: WriteSummary,
    pub entry_kinds: EntryTally,
}

/// Per-kind entry counts of the decoded batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryTally {
    pub success: usize,
    pub failure: usize,
    pub unexpected_signal: usize,
}

/// A rejected batch: the stage it failed in and why.
#[derive(Debug, Clone)]
pub struct IngestFailure {
    pub ingest_id: String,
    pub stage: IngestStage,
    pub error: IngestError,
}

impl IngestFailure {
    pub fn outcome(&self) -> IngestOutcome {
        IngestOutcome::from(&self.error)
    }
}

/// Result of [`run_ingest`].
pub type IngestResult = std::result::Result<IngestReport, IngestFailure>;

/// Ingest one raw batch document, stamping it with the current time.
pub fn run_ingest(store: &mut Store, raw: &[u8]) -> IngestResult {
    run_ingest_at(store, raw, Utc::now())
}

/// Ingest one raw batch document with an explicit submission time.
pub fn run_ingest_at(store: &mut Store, raw: &[u8], submitted_at: DateTime<Utc>) -> IngestResult {
    let ingest_id = generate_ingest_id();
    let span = info_span!("ingest", ingest_id = %ingest_id, stage = field::Empty);
    let _guard = span.enter();
    let started = Instant::now();

    let mut stage = IngestStage::Received;
    span.record("stage", stage.as_stage().as_str());
    info!(
        event = event_names::INGEST_RECEIVED,
        bytes = raw.len() as u64,
        "batch received"
    );

    let result = pipeline(store, raw, submitted_at, &mut |next| {
        stage = next;
        span.record("stage", next.as_stage().as_str());
    });

    match result {
        Ok((arch, summary, entry_kinds)) => {
            info!(
                event = event_names::INGEST_COMMITTED,
                batch_id = summary.batch_id.0,
                arch = %arch,
                successes = summary.successes as u64,
                failures = summary.failures as u64,
                signal_errors = summary.signal_errors as u64,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch committed"
            );
            Ok(IngestReport {
                ingest_id,
                arch,
                summary,
                entry_kinds,
            })
        }
        Err(error) => {
            warn!(
                event = event_names::INGEST_FAILED,
                failed_stage = %stage,
                code = error.code(),
                category = %error.category(),
                detail = error.detail().unwrap_or(""),
                error = %error,
                "batch rejected"
            );
            Err(IngestFailure {
                ingest_id,
                stage,
                error,
            })
        }
    }
}

/// Ingest one raw batch document and return the submitter-facing outcome.
pub fn ingest(store: &mut Store, raw: &[u8]) -> IngestOutcome {
    match run_ingest(store, raw) {
        Ok(_) => IngestOutcome::Success,
        Err(failure) => failure.outcome(),
    }
}

fn pipeline(
    store: &mut Store,
    raw: &[u8],
    submitted_at: DateTime<Utc>,
    advance: &mut dyn FnMut(IngestStage),
) -> fm_common::Result<(String, WriteSummary, EntryTally)> {
    advance(IngestStage::Parsing);
    let batch = parse_batch(raw)?;
    let tally = tally(&batch);

    advance(IngestStage::Resolving);
    let refs = resolve_refs(store, &batch)?;

    advance(IngestStage::Writing);
    let tx = store
        .connection_mut()
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| storage_error("begin transaction", e))?;
    let summary = BatchWriter::new(&tx, &refs).write(&batch, submitted_at)?;
    tx.commit().map_err(|e| storage_error("commit batch", e))?;

    advance(IngestStage::Committed);
    Ok((batch.arch, summary, tally))
}

fn resolve_refs(store: &Store, batch: &Batch) -> fm_common::Result<ResolvedRefs> {
    let conn = store.connection();
    let arch: Arch = resolve(conn, &batch.arch, &())?;
    let host: Host = resolve(conn, &batch.testing_host, &arch.id)?;
    if host.arch_id != arch.id {
        return Err(IngestError::invalid_value(
            "arch",
            format!(
                "testing host '{}' is registered under a different architecture than '{}'",
                host.hostname, arch.name
            ),
        ));
    }
    let user: User = resolve(conn, &batch.fuzzer_user, &())?;
    Ok(ResolvedRefs { arch, host, user })
}

fn tally(batch: &Batch) -> EntryTally {
    use crate::batch::EntryKind;

    let mut tally = EntryTally::default();
    for entry in &batch.entries {
        match entry.kind() {
            EntryKind::Success => tally.success += 1,
            EntryKind::Failure => tally.failure += 1,
            EntryKind::UnexpectedSignal => tally.unexpected_signal += 1,
        }
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(store: &Store, table: &str) -> i64 {
        store
            .connection()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
            .unwrap()
    }

    const GOOD: &str = r#"{"fuzzer-host":"fh1","fuzzer-user":"u1","testing-host":"th1",
        "arch":"x86","entries":[{"type":"success","opcode":"ADD","count":"5"}]}"#;

    #[test]
    fn committed_batch_reports_summary() {
        let mut store = Store::open_in_memory().unwrap();
        let report = run_ingest(&mut store, GOOD.as_bytes()).unwrap();
        assert!(report.ingest_id.starts_with("ing-"));
        assert_eq!(report.arch, "x86");
        assert_eq!(report.summary.successes, 1);
        assert_eq!(report.entry_kinds.success, 1);
        assert_eq!(count(&store, "batch"), 1);
    }

    #[test]
    fn parse_failures_are_tagged_with_parsing_stage() {
        let mut store = Store::open_in_memory().unwrap();
        let failure = run_ingest(&mut store, b"{not json").unwrap_err();
        assert_eq!(failure.stage, IngestStage::Parsing);
        assert!(matches!(failure.error, IngestError::MalformedDocument(_)));
        assert_eq!(count(&store, "arch"), 0);
    }

    #[test]
    fn host_registered_under_other_arch_is_rejected_while_resolving() {
        let mut store = Store::open_in_memory().unwrap();
        run_ingest(&mut store, GOOD.as_bytes()).unwrap();

        let other = GOOD.replace("\"x86\"", "\"arm\"");
        let failure = run_ingest(&mut store, other.as_bytes()).unwrap_err();
        assert_eq!(failure.stage, IngestStage::Resolving);
        match failure.outcome() {
            IngestOutcome::Failure { message } => assert!(message.starts_with("Invalid value:")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(count(&store, "batch"), 1);
        // The new arch was resolved before the host check and stays.
        assert_eq!(count(&store, "arch"), 2);
    }

    #[test]
    fn write_failure_rolls_back_the_batch() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_signal BEFORE INSERT ON test_signal_error
                 BEGIN SELECT RAISE(ABORT, 'signal rows disabled'); END;",
            )
            .unwrap();

        let doc = r#"{"fuzzer-host":"fh1","fuzzer-user":"u1","testing-host":"th1","arch":"x86",
            "entries":[{"type":"success","opcode":"ADD","count":1},
                       {"type":"unexpectedSignal","opcode":"LDR","pretty":"ldr","bytes":"00",
                        "signal":11,"inputs":[]}]}"#;
        let failure = run_ingest(&mut store, doc.as_bytes()).unwrap_err();
        assert_eq!(failure.stage, IngestStage::Writing);
        assert!(failure.error.user_message().starts_with("Error:"));
        match &failure.error {
            IngestError::StorageFailure { detail, .. } => {
                assert!(detail.contains("signal rows disabled"), "{}", detail)
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert_eq!(count(&store, "batch"), 0);
        assert_eq!(count(&store, "test_success"), 0);
        assert_eq!(count(&store, "opcode"), 0);
        // Autocommitted references survive.
        assert_eq!(count(&store, "host"), 1);
    }

    #[test]
    fn ingest_returns_wire_outcome() {
        let mut store = Store::open_in_memory().unwrap();
        assert_eq!(ingest(&mut store, GOOD.as_bytes()), IngestOutcome::Success);
        match ingest(&mut store, br#"{"fuzzer-host":"fh1"}"#) {
            IngestOutcome::Failure { message } => assert_eq!(message, "Invalid key 'fuzzer-user'"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn stage_names_match_log_stages() {
        assert_eq!(IngestStage::Resolving.to_string(), "resolving");
        assert_eq!(IngestStage::Committed.as_stage(), Stage::Committed);
    }
}
