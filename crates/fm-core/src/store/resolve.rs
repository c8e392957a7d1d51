//! Idempotent get-or-create for shared reference entities.
//!
//! Arch, Host, User and Opcode rows are created lazily the first time a batch
//! mentions them and are never modified afterwards. Many fuzzer hosts post
//! batches concurrently, frequently naming the same previously-unseen arch or
//! opcode, so resolution must not rely on read-then-write:
//!
//! 1. look the natural key up;
//! 2. if absent, insert it;
//! 3. if the insert hits the UNIQUE constraint (another writer won the race)
//!    or the database is busy, go back to 1.
//!
//! The loop is bounded by [`MAX_RESOLVE_ATTEMPTS`]; a conflict that outlives
//! it propagates as [`IngestError::StorageConflict`].

use fm_common::{Arch, ArchId, Host, IngestError, Opcode, Result, User};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{
    arch_from_row, host_from_row, opcode_from_row, storage_error, user_from_row, ARCH_COLUMNS,
    HOST_COLUMNS, OPCODE_COLUMNS, USER_COLUMNS,
};
use crate::logging::event_names;

/// Lookup/insert rounds before a conflict is reported.
pub const MAX_RESOLVE_ATTEMPTS: usize = 3;

/// A reference entity addressable by a natural key.
///
/// `Fields` carries whatever besides the key is needed to create the row. For
/// an [`Opcode`] it is the owning arch, which also scopes the lookup; for a
/// [`Host`] it is the arch recorded at creation and ignored by the lookup.
pub trait Reference: Sized {
    /// Entity name used in logs and error messages.
    const KIND: &'static str;

    type Fields;

    fn find(conn: &Connection, key: &str, fields: &Self::Fields) -> rusqlite::Result<Option<Self>>;

    fn insert(conn: &Connection, key: &str, fields: &Self::Fields) -> rusqlite::Result<Self>;
}

/// Return the entity with natural key `key`, creating it from `fields` if it
/// does not exist yet.
pub fn resolve<T: Reference>(conn: &Connection, key: &str, fields: &T::Fields) -> Result<T> {
    let operation = || format!("resolve {} '{}'", T::KIND, key);

    for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
        match T::find(conn, key, fields) {
            Ok(Some(found)) => return Ok(found),
            Ok(None) => {}
            Err(err) => {
                let err = storage_error(operation(), err);
                if err.is_retryable() && attempt < MAX_RESOLVE_ATTEMPTS {
                    retrying(T::KIND, key, attempt);
                    continue;
                }
                return Err(err);
            }
        }

        match T::insert(conn, key, fields) {
            Ok(created) => {
                info!(
                    event = event_names::RESOLVE_CREATED,
                    kind = T::KIND,
                    key = %key,
                    "created reference entity"
                );
                return Ok(created);
            }
            Err(err) => {
                let err = storage_error(operation(), err);
                if err.is_retryable() && attempt < MAX_RESOLVE_ATTEMPTS {
                    retrying(T::KIND, key, attempt);
                    continue;
                }
                return Err(err);
            }
        }
    }

    Err(IngestError::StorageConflict {
        operation: operation(),
    })
}

fn retrying(kind: &str, key: &str, attempt: usize) {
    debug!(
        event = event_names::RESOLVE_CONFLICT_RETRY,
        kind,
        key = %key,
        attempt,
        "conflict while resolving, re-fetching"
    );
}

impl Reference for Arch {
    const KIND: &'static str = "arch";
    type Fields = ();

    fn find(conn: &Connection, name: &str, _: &()) -> rusqlite::Result<Option<Self>> {
        conn.prepare_cached(&format!("SELECT {} FROM arch WHERE name = ?1", ARCH_COLUMNS))?
            .query_row(params![name], arch_from_row)
            .optional()
    }

    fn insert(conn: &Connection, name: &str, _: &()) -> rusqlite::Result<Self> {
        conn.prepare_cached(&format!(
            "INSERT INTO arch (name) VALUES (?1) RETURNING {}",
            ARCH_COLUMNS
        ))?
        .query_row(params![name], arch_from_row)
    }
}

impl Reference for Host {
    const KIND: &'static str = "host";
    type Fields = ArchId;

    fn find(conn: &Connection, hostname: &str, _: &ArchId) -> rusqlite::Result<Option<Self>> {
        conn.prepare_cached(&format!(
            "SELECT {} FROM host WHERE hostname = ?1",
            HOST_COLUMNS
        ))?
        .query_row(params![hostname], host_from_row)
        .optional()
    }

    fn insert(conn: &Connection, hostname: &str, arch: &ArchId) -> rusqlite::Result<Self> {
        conn.prepare_cached(&format!(
            "INSERT INTO host (hostname, arch_id) VALUES (?1, ?2) RETURNING {}",
            HOST_COLUMNS
        ))?
        .query_row(params![hostname, arch.0], host_from_row)
    }
}

impl Reference for User {
    const KIND: &'static str = "user";
    type Fields = ();

    fn find(conn: &Connection, username: &str, _: &()) -> rusqlite::Result<Option<Self>> {
        conn.prepare_cached(&format!(
            "SELECT {} FROM fuzz_user WHERE username = ?1",
            USER_COLUMNS
        ))?
        .query_row(params![username], user_from_row)
        .optional()
    }

    fn insert(conn: &Connection, username: &str, _: &()) -> rusqlite::Result<Self> {
        conn.prepare_cached(&format!(
            "INSERT INTO fuzz_user (username) VALUES (?1) RETURNING {}",
            USER_COLUMNS
        ))?
        .query_row(params![username], user_from_row)
    }
}

impl Reference for Opcode {
    const KIND: &'static str = "opcode";
    type Fields = ArchId;

    fn find(conn: &Connection, name: &str, arch: &ArchId) -> rusqlite::Result<Option<Self>> {
        conn.prepare_cached(&format!(
            "SELECT {} FROM opcode WHERE name = ?1 AND arch_id = ?2",
            OPCODE_COLUMNS
        ))?
        .query_row(params![name, arch.0], opcode_from_row)
        .optional()
    }

    fn insert(conn: &Connection, name: &str, arch: &ArchId) -> rusqlite::Result<Self> {
        conn.prepare_cached(&format!(
            "INSERT INTO opcode (name, arch_id) VALUES (?1, ?2) RETURNING {}",
            OPCODE_COLUMNS
        ))?
        .query_row(params![name, arch.0], opcode_from_row)
    }
}
