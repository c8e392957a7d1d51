//! Persists a decoded batch and its typed entries.
//!
//! Write order is fixed by identity dependencies: the batch row first, then
//! for every entry its opcode (resolved lazily against the batch arch), the
//! typed entry row, and finally that entry's child rows in one bulk insert.
//! The writer never opens or commits a transaction itself; the caller hands
//! it a connection that is already inside one.

use chrono::{DateTime, Utc};
use fm_common::{Arch, BatchId, Host, IngestError, Opcode, Result, User};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use super::{format_timestamp, resolve, storage_error};
use crate::batch::{Batch, BatchEntry, FailureEntry, Input, SignalEntry, SuccessEntry};

/// Largest number of child rows sent in one INSERT statement. Keeps the bound
/// parameter count well under SQLite's variable limit.
const BULK_CHUNK_ROWS: usize = 500;

/// Shared entities resolved before the batch is written.
#[derive(Debug, Clone)]
pub struct ResolvedRefs {
    pub arch: Arch,
    pub host: Host,
    pub user: User,
}

/// What one call to [`BatchWriter::write`] persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub batch_id: BatchId,
    pub successes: usize,
    pub failures: usize,
    pub signal_errors: usize,
    pub child_rows: usize,
}

impl WriteSummary {
    pub fn entries(&self) -> usize {
        self.successes + self.failures + self.signal_errors
    }
}

/// Writes one batch against already-resolved reference entities.
pub struct BatchWriter<'c> {
    conn: &'c Connection,
    refs: &'c ResolvedRefs,
}

impl<'c> BatchWriter<'c> {
    pub fn new(conn: &'c Connection, refs: &'c ResolvedRefs) -> Self {
        BatchWriter { conn, refs }
    }

    /// Insert the batch row and every entry. On error the caller must roll
    /// back; rows written so far are not cleaned up here.
    pub fn write(&self, batch: &Batch, submitted_at: DateTime<Utc>) -> Result<WriteSummary> {
        let batch_id = self.insert_batch_row(batch, submitted_at)?;
        let mut summary = WriteSummary {
            batch_id,
            successes: 0,
            failures: 0,
            signal_errors: 0,
            child_rows: 0,
        };

        for entry in &batch.entries {
            let opcode = self.resolve_opcode(entry.opcode())?;
            match entry {
                BatchEntry::Success(success) => {
                    self.insert_success(batch_id, &opcode, success)?;
                    summary.successes += 1;
                }
                BatchEntry::Failure(failure) => {
                    summary.child_rows += self.insert_failure(batch_id, &opcode, failure)?;
                    summary.failures += 1;
                }
                BatchEntry::UnexpectedSignal(signal) => {
                    summary.child_rows += self.insert_signal_error(batch_id, &opcode, signal)?;
                    summary.signal_errors += 1;
                }
            }
        }

        debug!(
            batch_id = %batch_id,
            entries = summary.entries(),
            child_rows = summary.child_rows,
            "batch rows written"
        );
        Ok(summary)
    }

    fn insert_batch_row(&self, batch: &Batch, submitted_at: DateTime<Utc>) -> Result<BatchId> {
        self.conn
            .prepare_cached(
                "INSERT INTO batch (testing_host_id, fuzzer_host, user_id, submitted_at)
                 VALUES (?1, ?2, ?3, ?4) RETURNING id",
            )
            .and_then(|mut stmt| {
                stmt.query_row(
                    params![
                        self.refs.host.id.0,
                        batch.fuzzer_host,
                        self.refs.user.id.0,
                        format_timestamp(submitted_at),
                    ],
                    |row| row.get::<_, i64>(0),
                )
            })
            .map(BatchId)
            .map_err(|e| storage_error("insert batch", e))
    }

    fn resolve_opcode(&self, name: &str) -> Result<Opcode> {
        let opcode: Opcode = resolve(self.conn, name, &self.refs.arch.id)?;
        if opcode.arch_id != self.refs.arch.id || self.refs.host.arch_id != self.refs.arch.id {
            return Err(IngestError::InternalInvariantViolation(format!(
                "opcode '{}' resolved under arch {} while writing a batch for arch {} (host arch {})",
                name, opcode.arch_id, self.refs.arch.id, self.refs.host.arch_id
            )));
        }
        Ok(opcode)
    }

    fn insert_success(&self, batch_id: BatchId, opcode: &Opcode, entry: &SuccessEntry) -> Result<()> {
        let count = i64::try_from(entry.count).map_err(|_| {
            IngestError::invalid_value("count", format!("{} is out of range", entry.count))
        })?;
        self.conn
            .prepare_cached(
                "INSERT INTO test_success (batch_id, opcode_id, count) VALUES (?1, ?2, ?3)",
            )
            .and_then(|mut stmt| stmt.execute(params![batch_id.0, opcode.id.0, count]))
            .map_err(|e| storage_error("insert test_success", e))?;
        Ok(())
    }

    /// Returns the number of child rows written.
    fn insert_failure(&self, batch_id: BatchId, opcode: &Opcode, entry: &FailureEntry) -> Result<usize> {
        let failure_id: i64 = self
            .conn
            .prepare_cached(
                "INSERT INTO test_failure (batch_id, opcode_id, pretty, bytes, arguments)
                 VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            )
            .and_then(|mut stmt| {
                stmt.query_row(
                    params![
                        batch_id.0,
                        opcode.id.0,
                        entry.pretty,
                        entry.bytes,
                        entry.raw_operands,
                    ],
                    |row| row.get(0),
                )
            })
            .map_err(|e| storage_error("insert test_failure", e))?;

        let states: Vec<[&str; 3]> = entry
            .state
            .iter()
            .map(|s| [s.location.as_str(), s.expected.as_str(), s.actual.as_str()])
            .collect();
        let written_states = bulk_insert(
            self.conn,
            "test_failure_state",
            "test_failure_id",
            ["location", "expected_value", "actual_value"],
            failure_id,
            &states,
        )?;
        let written_inputs = bulk_insert(
            self.conn,
            "test_failure_input",
            "test_failure_id",
            ["location", "value"],
            failure_id,
            &input_rows(&entry.inputs),
        )?;
        Ok(written_states + written_inputs)
    }

    /// Returns the number of child rows written.
    fn insert_signal_error(&self, batch_id: BatchId, opcode: &Opcode, entry: &SignalEntry) -> Result<usize> {
        let signal_error_id: i64 = self
            .conn
            .prepare_cached(
                "INSERT INTO test_signal_error (batch_id, opcode_id, pretty, bytes, signal)
                 VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            )
            .and_then(|mut stmt| {
                stmt.query_row(
                    params![batch_id.0, opcode.id.0, entry.pretty, entry.bytes, entry.signal],
                    |row| row.get(0),
                )
            })
            .map_err(|e| storage_error("insert test_signal_error", e))?;

        bulk_insert(
            self.conn,
            "test_signal_error_input",
            "test_signal_error_id",
            ["location", "value"],
            signal_error_id,
            &input_rows(&entry.inputs),
        )
    }
}

fn input_rows(inputs: &[Input]) -> Vec<[&str; 2]> {
    inputs
        .iter()
        .map(|i| [i.location.as_str(), i.value.as_str()])
        .collect()
}

/// Insert `rows` as children of `parent_id` with multi-row INSERT statements.
///
/// Each row also gets a `seq` column holding its position so readers can
/// restore document order. Table and column names are compile-time constants.
fn bulk_insert<const N: usize>(
    conn: &Connection,
    table: &'static str,
    parent_column: &'static str,
    columns: [&'static str; N],
    parent_id: i64,
    rows: &[[&str; N]],
) -> Result<usize> {
    let operation = || format!("bulk insert {}", table);
    let mut written = 0;

    for (chunk_index, chunk) in rows.chunks(BULK_CHUNK_ROWS).enumerate() {
        let placeholders = vec![format!("({})", vec!["?"; N + 2].join(", ")); chunk.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}, seq, {}) VALUES {}",
            table,
            parent_column,
            columns.join(", "),
            placeholders
        );

        let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * (N + 2));
        for (offset, row) in chunk.iter().enumerate() {
            let seq = (chunk_index * BULK_CHUNK_ROWS + offset) as i64;
            values.push(Value::Integer(parent_id));
            values.push(Value::Integer(seq));
            values.extend(row.iter().map(|cell| Value::Text((*cell).to_string())));
        }

        written += conn
            .prepare_cached(&sql)
            .and_then(|mut stmt| stmt.execute(params_from_iter(values.iter())))
            .map_err(|e| storage_error(operation(), e))?;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::StateValue;
    use crate::store::Store;
    use fm_common::ArchId;

    fn refs(conn: &Connection) -> ResolvedRefs {
        let arch: Arch = resolve(conn, "x86", &()).unwrap();
        let host: Host = resolve(conn, "th1", &arch.id).unwrap();
        let user: User = resolve(conn, "u1", &()).unwrap();
        ResolvedRefs { arch, host, user }
    }

    fn batch(entries: Vec<BatchEntry>) -> Batch {
        Batch {
            fuzzer_host: "fh1".into(),
            fuzzer_user: "u1".into(),
            testing_host: "th1".into(),
            arch: "x86".into(),
            entries,
        }
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn failure(opcode: &str, states: usize, inputs: usize) -> BatchEntry {
        BatchEntry::Failure(FailureEntry {
            opcode: opcode.into(),
            raw_operands: "r1 r2".into(),
            pretty: "add r1, r2".into(),
            bytes: "7c221a14".into(),
            state: (0..states)
                .map(|i| StateValue {
                    location: format!("r{}", i),
                    expected: "1".into(),
                    actual: "2".into(),
                })
                .collect(),
            inputs: (0..inputs)
                .map(|i| Input {
                    location: format!("r{}", i),
                    value: i.to_string(),
                })
                .collect(),
        })
    }

    #[test]
    fn writes_failure_with_children() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.connection();
        let refs = refs(conn);

        let summary = BatchWriter::new(conn, &refs)
            .write(&batch(vec![failure("ADD", 2, 3)]), Utc::now())
            .unwrap();

        assert_eq!(summary.failures, 1);
        assert_eq!(summary.child_rows, 5);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM test_failure_state"), 2);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM test_failure_input"), 3);
        assert_eq!(
            count(
                conn,
                "SELECT COUNT(DISTINCT test_failure_id) FROM \
                 (SELECT test_failure_id FROM test_failure_state \
                  UNION ALL SELECT test_failure_id FROM test_failure_input)"
            ),
            1
        );
    }

    #[test]
    fn repeated_opcode_resolves_to_one_row() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.connection();
        let refs = refs(conn);

        BatchWriter::new(conn, &refs)
            .write(
                &batch(vec![failure("ADD", 1, 1), failure("ADD", 0, 0)]),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(count(conn, "SELECT COUNT(*) FROM opcode"), 1);
        assert_eq!(
            count(conn, "SELECT COUNT(DISTINCT opcode_id) FROM test_failure"),
            1
        );
        assert_eq!(count(conn, "SELECT COUNT(*) FROM test_failure"), 2);
    }

    #[test]
    fn writes_every_entry_kind() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.connection();
        let refs = refs(conn);

        let summary = BatchWriter::new(conn, &refs)
            .write(
                &batch(vec![
                    BatchEntry::Success(SuccessEntry {
                        opcode: "ADD".into(),
                        count: 5,
                    }),
                    failure("SUB", 1, 1),
                    BatchEntry::UnexpectedSignal(SignalEntry {
                        opcode: "LDR".into(),
                        pretty: "ldr r0, [r1]".into(),
                        bytes: "e5910000".into(),
                        signal: 11,
                        inputs: vec![Input {
                            location: "r1".into(),
                            value: "0".into(),
                        }],
                    }),
                ]),
                Utc::now(),
            )
            .unwrap();

        assert_eq!(summary.entries(), 3);
        assert_eq!(count(conn, "SELECT count FROM test_success"), 5);
        assert_eq!(count(conn, "SELECT signal FROM test_signal_error"), 11);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM test_signal_error_input"), 1);
        assert_eq!(count(conn, "SELECT COUNT(*) FROM opcode"), 3);
    }

    #[test]
    fn child_rows_keep_document_order_across_chunks() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.connection();
        let refs = refs(conn);
        let inputs = BULK_CHUNK_ROWS + 7;

        BatchWriter::new(conn, &refs)
            .write(&batch(vec![failure("ADD", 0, inputs)]), Utc::now())
            .unwrap();

        assert_eq!(
            count(conn, "SELECT COUNT(*) FROM test_failure_input"),
            inputs as i64
        );
        let last: String = conn
            .query_row(
                "SELECT value FROM test_failure_input ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last, (inputs - 1).to_string());
    }

    #[test]
    fn mismatched_host_arch_is_an_invariant_violation() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.connection();
        let mut refs = refs(conn);
        refs.host.arch_id = ArchId(refs.arch.id.0 + 100);

        let err = BatchWriter::new(conn, &refs)
            .write(
                &batch(vec![BatchEntry::Success(SuccessEntry {
                    opcode: "ADD".into(),
                    count: 1,
                })]),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, IngestError::InternalInvariantViolation(_)));
    }
}
