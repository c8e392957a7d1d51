//! SQLite persistence for fuzzing results.
//!
//! The schema mirrors the relational model exactly: shared reference tables
//! (`arch`, `host`, `fuzz_user`, `opcode`) with UNIQUE natural keys, the
//! append-only `batch` table, and one table per entry kind plus their child
//! tables. Natural-key uniqueness is enforced here and nowhere else; the
//! resolver relies on it to stay correct across processes.
//!
//! # Schema Versioning
//!
//! The database uses SQLite's `user_version` pragma to track schema versions.
//! When the schema changes, increment `SCHEMA_VERSION` and add a migration
//! step in `run_migrations`.
//!
//! # Concurrency
//!
//! Every connection runs in WAL mode with a busy timeout, so many server
//! workers (or many server processes) can share one database file. A
//! `Connection` is not `Sync`; each worker owns its own [`Store`].

pub mod resolve;
pub mod writer;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use fm_common::{Arch, Host, IngestError, Opcode, User};
use rusqlite::{ffi, Connection, ErrorCode, Row};
use thiserror::Error;
use tracing::{debug, warn};

pub use resolve::{resolve, Reference, MAX_RESOLVE_ATTEMPTS};
pub use writer::{BatchWriter, ResolvedRefs, WriteSummary};

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Default time a statement waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from opening, migrating or querying the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sqlite journal_mode is '{0}', expected 'wal'")]
    JournalModeNotWal(String),

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("I/O error preparing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One connection to the results database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the database at `path` and run pending migrations.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(StoreError::JournalModeNotWal(mode));
        }

        Self::configure(conn)
    }

    /// Create a private in-memory database (for tests and dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn)
    }

    fn configure(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        let store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let current: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }

        if current < SCHEMA_VERSION {
            run_migrations(&self.conn, current)?;
            self.conn
                .pragma_update(None, "user_version", SCHEMA_VERSION)?;
            debug!(from = current, to = SCHEMA_VERSION, "store schema migrated");
        }

        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

fn run_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    // v0 -> v1: initial schema
    if from_version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS arch (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS host (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hostname TEXT NOT NULL UNIQUE,
                arch_id INTEGER NOT NULL REFERENCES arch(id)
            );
            CREATE INDEX IF NOT EXISTS idx_host_arch ON host(arch_id);

            CREATE TABLE IF NOT EXISTS fuzz_user (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS opcode (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                arch_id INTEGER NOT NULL REFERENCES arch(id),
                UNIQUE (name, arch_id)
            );
            CREATE INDEX IF NOT EXISTS idx_opcode_arch ON opcode(arch_id);

            CREATE TABLE IF NOT EXISTS batch (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                testing_host_id INTEGER NOT NULL REFERENCES host(id),
                fuzzer_host TEXT NOT NULL,
                user_id INTEGER NOT NULL REFERENCES fuzz_user(id),
                submitted_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_batch_host_submitted
                ON batch(testing_host_id, submitted_at);

            CREATE TABLE IF NOT EXISTS test_success (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id INTEGER NOT NULL REFERENCES batch(id),
                opcode_id INTEGER NOT NULL REFERENCES opcode(id),
                count INTEGER NOT NULL CHECK (count >= 0)
            );
            CREATE INDEX IF NOT EXISTS idx_success_batch ON test_success(batch_id);
            CREATE INDEX IF NOT EXISTS idx_success_opcode ON test_success(opcode_id);

            CREATE TABLE IF NOT EXISTS test_failure (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id INTEGER NOT NULL REFERENCES batch(id),
                opcode_id INTEGER NOT NULL REFERENCES opcode(id),
                pretty TEXT NOT NULL,
                bytes TEXT NOT NULL,
                arguments TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_failure_batch ON test_failure(batch_id);
            CREATE INDEX IF NOT EXISTS idx_failure_opcode ON test_failure(opcode_id);

            CREATE TABLE IF NOT EXISTS test_failure_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_failure_id INTEGER NOT NULL REFERENCES test_failure(id),
                seq INTEGER NOT NULL,
                location TEXT NOT NULL,
                expected_value TEXT NOT NULL,
                actual_value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_failure_state_parent
                ON test_failure_state(test_failure_id, seq);

            CREATE TABLE IF NOT EXISTS test_failure_input (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_failure_id INTEGER NOT NULL REFERENCES test_failure(id),
                seq INTEGER NOT NULL,
                location TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_failure_input_parent
                ON test_failure_input(test_failure_id, seq);

            CREATE TABLE IF NOT EXISTS test_signal_error (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id INTEGER NOT NULL REFERENCES batch(id),
                opcode_id INTEGER NOT NULL REFERENCES opcode(id),
                pretty TEXT NOT NULL,
                bytes TEXT NOT NULL,
                signal INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signal_error_batch ON test_signal_error(batch_id);
            CREATE INDEX IF NOT EXISTS idx_signal_error_opcode ON test_signal_error(opcode_id);

            CREATE TABLE IF NOT EXISTS test_signal_error_input (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_signal_error_id INTEGER NOT NULL REFERENCES test_signal_error(id),
                seq INTEGER NOT NULL,
                location TEXT NOT NULL,
                value TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signal_error_input_parent
                ON test_signal_error_input(test_signal_error_id, seq);
            "#,
        )?;
    }

    Ok(())
}

/// Map a driver error onto the ingestion taxonomy.
///
/// Unique-key violations and lock contention are conflicts: another writer
/// got there first and the caller may re-read. Every other constraint
/// failure (foreign key, check, not null, trigger) is permanent and lands
/// in [`IngestError::StorageFailure`] along with all remaining driver errors.
pub(crate) fn storage_error(operation: impl Into<String>, err: rusqlite::Error) -> IngestError {
    let operation = operation.into();
    if is_conflict(&err) {
        debug!(operation = %operation, error = %err, "storage conflict");
        return IngestError::StorageConflict { operation };
    }
    warn!(operation = %operation, error = %err, "storage failure");
    IngestError::StorageFailure {
        operation,
        detail: err.to_string(),
    }
}

fn is_conflict(err: &rusqlite::Error) -> bool {
    let rusqlite::Error::SqliteFailure(e, _) = err else {
        return false;
    };
    match e.code {
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => true,
        ErrorCode::ConstraintViolation => matches!(
            e.extended_code,
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        ),
        _ => false,
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so they sort lexically.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) const ARCH_COLUMNS: &str = "id, name";
pub(crate) const HOST_COLUMNS: &str = "id, hostname, arch_id";
pub(crate) const USER_COLUMNS: &str = "id, username";
pub(crate) const OPCODE_COLUMNS: &str = "id, name, arch_id";

pub(crate) fn arch_from_row(row: &Row<'_>) -> rusqlite::Result<Arch> {
    Ok(Arch {
        id: row.get::<_, i64>(0)?.into(),
        name: row.get(1)?,
    })
}

pub(crate) fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: row.get::<_, i64>(0)?.into(),
        hostname: row.get(1)?,
        arch_id: row.get::<_, i64>(2)?.into(),
    })
}

pub(crate) fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get::<_, i64>(0)?.into(),
        username: row.get(1)?,
    })
}

pub(crate) fn opcode_from_row(row: &Row<'_>) -> rusqlite::Result<Opcode> {
    Ok(Opcode {
        id: row.get::<_, i64>(0)?.into(),
        name: row.get(1)?,
        arch_id: row.get::<_, i64>(2)?.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn in_memory_store_migrates() {
        let store = Store::open_in_memory().unwrap();
        let version: i32 = store
            .connection()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = store
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('arch','host','fuzz_user','opcode','batch','test_success','test_failure', \
                  'test_failure_state','test_failure_input','test_signal_error', \
                  'test_signal_error_input')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 11);
    }

    #[test]
    fn file_store_uses_wal_and_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("results.db");

        {
            let store = Store::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
            store
                .connection()
                .execute("INSERT INTO arch (name) VALUES ('x86')", [])
                .unwrap();
        }

        let store = Store::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        let mode: String = store
            .connection()
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let count: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM arch", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }
        match Store::open(&path, DEFAULT_BUSY_TIMEOUT) {
            Err(StoreError::SchemaTooNew { found, supported }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("expected SchemaTooNew, got {:?}", other.err()),
        }
    }

    #[test]
    fn unique_violation_maps_to_conflict() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.connection();
        conn.execute("INSERT INTO arch (name) VALUES ('x86')", [])
            .unwrap();
        let err = conn
            .execute("INSERT INTO arch (name) VALUES ('x86')", [])
            .unwrap_err();
        let mapped = storage_error("insert arch", err);
        assert!(mapped.is_retryable());
    }

    #[test]
    fn foreign_key_violation_is_not_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .connection()
            .execute("INSERT INTO host (hostname, arch_id) VALUES ('th-orphan', 999)", [])
            .unwrap_err();
        let mapped = storage_error("insert host", err);
        assert!(!mapped.is_retryable());
        match &mapped {
            IngestError::StorageFailure { detail, .. } => {
                assert!(detail.contains("FOREIGN KEY"), "{}", detail)
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn not_null_violation_is_not_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .connection()
            .execute("INSERT INTO arch (name) VALUES (NULL)", [])
            .unwrap_err();
        let mapped = storage_error("insert arch", err);
        assert!(matches!(mapped, IngestError::StorageFailure { .. }));
    }

    #[test]
    fn other_failures_map_to_storage_failure() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .connection()
            .execute("INSERT INTO no_such_table (x) VALUES (1)", [])
            .unwrap_err();
        let mapped = storage_error("insert", err);
        assert!(matches!(mapped, IngestError::StorageFailure { .. }));
        assert!(mapped.detail().unwrap().contains("no_such_table"));
    }

    #[test]
    fn timestamps_roundtrip_and_sort() {
        let early = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (format_timestamp(early), format_timestamp(late));
        assert!(a < b);
        assert_eq!(parse_timestamp(0, &a).unwrap(), early);
        assert!(parse_timestamp(0, "yesterday").is_err());
    }
}
