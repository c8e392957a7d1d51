//! Read-only aggregation queries behind the dashboards.
//!
//! Every function takes a plain `&Connection` and never writes. Counts are
//! row counts: a success entry with `count: 500` is one success, as the
//! dashboards have always shown it.

use chrono::{DateTime, Utc};
use fm_common::{
    Arch, ArchId, BatchRecord, DisplayMode, FailureId, FailureInputRow, FailureStateRow, Host,
    HostId, Opcode, OpcodeId, SignalErrorId, SignalErrorInputRow, TestFailureRecord,
    TestSignalErrorRecord,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::store::{
    arch_from_row, host_from_row, opcode_from_row, parse_timestamp, Result, ARCH_COLUMNS,
    HOST_COLUMNS, OPCODE_COLUMNS,
};

/// Outcome totals for one opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub failures: u64,
    pub successes: u64,
    pub signal_errors: u64,
}

impl OutcomeCounts {
    /// Share of failing trials in percent, rounded to two decimals.
    ///
    /// An opcode with no results at all counts as 100% failing.
    pub fn percent_failing(&self) -> f64 {
        let failing = self.failures + self.signal_errors;
        let total = failing + self.successes;
        if total == 0 {
            return 100.0;
        }
        (100.0 * failing as f64 / total as f64 * 100.0).round() / 100.0
    }
}

/// Batch count and most recent upload for a testing host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchActivity {
    pub batch_count: u64,
    pub last_batch_time: Option<DateTime<Utc>>,
}

/// One host row on the overview page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSummary {
    pub host: Host,
    pub batch_count: u64,
    pub last_batch_time: Option<DateTime<Utc>>,
    pub num_failures: u64,
    pub num_successes: u64,
}

/// One arch block on the overview page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchOverview {
    pub arch: Arch,
    pub hosts: Vec<HostSummary>,
}

/// One opcode row on the arch page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpcodeStatus {
    pub opcode: Opcode,
    pub num_failures: u64,
    pub num_successes: u64,
    pub num_signal_errors: u64,
    pub percent_failing: f64,
}

impl OpcodeStatus {
    fn new(opcode: Opcode, counts: OutcomeCounts) -> Self {
        OpcodeStatus {
            opcode,
            num_failures: counts.failures,
            num_successes: counts.successes,
            num_signal_errors: counts.signal_errors,
            percent_failing: counts.percent_failing(),
        }
    }
}

/// Column the arch page is sorted by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpcodeSort {
    #[default]
    Opcode,
    NumFailures,
    NumSignalErrors,
    NumSuccesses,
    PercentFailing,
}

impl OpcodeSort {
    pub const ALL: [OpcodeSort; 5] = [
        OpcodeSort::Opcode,
        OpcodeSort::NumFailures,
        OpcodeSort::NumSignalErrors,
        OpcodeSort::NumSuccesses,
        OpcodeSort::PercentFailing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpcodeSort::Opcode => "opcode",
            OpcodeSort::NumFailures => "num_failures",
            OpcodeSort::NumSignalErrors => "num_signal_errors",
            OpcodeSort::NumSuccesses => "num_successes",
            OpcodeSort::PercentFailing => "percent_failing",
        }
    }

    /// Unknown or missing keys fall back to sorting by opcode name.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        raw.and_then(|s| OpcodeSort::ALL.into_iter().find(|k| k.as_str() == s))
            .unwrap_or_default()
    }

    fn compare(&self, a: &OpcodeStatus, b: &OpcodeStatus) -> std::cmp::Ordering {
        match self {
            OpcodeSort::Opcode => a.opcode.name.cmp(&b.opcode.name),
            OpcodeSort::NumFailures => a.num_failures.cmp(&b.num_failures),
            OpcodeSort::NumSignalErrors => a.num_signal_errors.cmp(&b.num_signal_errors),
            OpcodeSort::NumSuccesses => a.num_successes.cmp(&b.num_successes),
            OpcodeSort::PercentFailing => a.percent_failing.total_cmp(&b.percent_failing),
        }
    }
}

/// Sort direction for the arch page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    /// Only `desc` selects descending order.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw {
            Some("desc") => SortDir::Desc,
            _ => SortDir::Asc,
        }
    }

    pub fn flip(self) -> Self {
        match self {
            SortDir::Asc => SortDir::Desc,
            SortDir::Desc => SortDir::Asc,
        }
    }
}

/// The arch page: every opcode of one arch with its outcome totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchView {
    pub arch: Arch,
    pub opcode_statuses: Vec<OpcodeStatus>,
    pub sort_order: OpcodeSort,
    pub dir: SortDir,
    pub flipdir: SortDir,
}

/// The opcode page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpcodeView {
    pub opcode: Opcode,
    pub counts: OutcomeCounts,
    pub failures: Vec<TestFailureRecord>,
    pub signal_errors: Vec<TestSignalErrorRecord>,
    pub numeric_display: DisplayMode,
}

/// A failure with everything recorded about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub failure: TestFailureRecord,
    pub opcode: Opcode,
    pub batch: BatchRecord,
    pub state: Vec<FailureStateRow>,
    pub inputs: Vec<FailureInputRow>,
}

/// A signal error with its inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalErrorDetail {
    pub signal_error: TestSignalErrorRecord,
    pub opcode: Opcode,
    pub batch: BatchRecord,
    pub inputs: Vec<SignalErrorInputRow>,
}

const FAILURE_COLUMNS: &str = "id, batch_id, opcode_id, pretty, bytes, arguments";
const SIGNAL_ERROR_COLUMNS: &str = "id, batch_id, opcode_id, pretty, bytes, signal";
const BATCH_COLUMNS: &str = "id, testing_host_id, fuzzer_host, user_id, submitted_at";

fn failure_from_row(row: &Row<'_>) -> rusqlite::Result<TestFailureRecord> {
    Ok(TestFailureRecord {
        id: row.get::<_, i64>(0)?.into(),
        batch_id: row.get::<_, i64>(1)?.into(),
        opcode_id: row.get::<_, i64>(2)?.into(),
        pretty: row.get(3)?,
        bytes: row.get(4)?,
        arguments: row.get(5)?,
    })
}

fn signal_error_from_row(row: &Row<'_>) -> rusqlite::Result<TestSignalErrorRecord> {
    Ok(TestSignalErrorRecord {
        id: row.get::<_, i64>(0)?.into(),
        batch_id: row.get::<_, i64>(1)?.into(),
        opcode_id: row.get::<_, i64>(2)?.into(),
        pretty: row.get(3)?,
        bytes: row.get(4)?,
        signal: row.get(5)?,
    })
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<BatchRecord> {
    let submitted_at: String = row.get(4)?;
    Ok(BatchRecord {
        id: row.get::<_, i64>(0)?.into(),
        testing_host_id: row.get::<_, i64>(1)?.into(),
        fuzzer_host: row.get(2)?,
        user_id: row.get::<_, i64>(3)?.into(),
        submitted_at: parse_timestamp(4, &submitted_at)?,
    })
}

fn count(conn: &Connection, sql: &str, id: i64) -> Result<u64> {
    let n: i64 = conn.prepare_cached(sql)?.query_row(params![id], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

/// All architectures, by name.
pub fn list_archs(conn: &Connection) -> Result<Vec<Arch>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT {} FROM arch ORDER BY name", ARCH_COLUMNS))?;
    let archs = stmt
        .query_map([], arch_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(archs)
}

pub fn get_arch(conn: &Connection, id: ArchId) -> Result<Option<Arch>> {
    Ok(conn
        .prepare_cached(&format!("SELECT {} FROM arch WHERE id = ?1", ARCH_COLUMNS))?
        .query_row(params![id.0], arch_from_row)
        .optional()?)
}

/// Testing hosts registered under `arch`, by hostname.
pub fn list_hosts_for_arch(conn: &Connection, arch: ArchId) -> Result<Vec<Host>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM host WHERE arch_id = ?1 ORDER BY hostname",
        HOST_COLUMNS
    ))?;
    let hosts = stmt
        .query_map(params![arch.0], host_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hosts)
}

pub fn batch_activity_for_host(conn: &Connection, host: HostId) -> Result<BatchActivity> {
    let (batch_count, last): (i64, Option<String>) = conn
        .prepare_cached(
            "SELECT COUNT(*), MAX(submitted_at) FROM batch WHERE testing_host_id = ?1",
        )?
        .query_row(params![host.0], |row| Ok((row.get(0)?, row.get(1)?)))?;

    let last_batch_time = last
        .as_deref()
        .map(|raw| parse_timestamp(1, raw))
        .transpose()?;

    Ok(BatchActivity {
        batch_count: batch_count.max(0) as u64,
        last_batch_time,
    })
}

/// Failures plus signal errors recorded by batches from `host`.
pub fn count_failures_by_host(conn: &Connection, host: HostId) -> Result<u64> {
    let failures = count(
        conn,
        "SELECT COUNT(*) FROM test_failure f JOIN batch b ON b.id = f.batch_id
         WHERE b.testing_host_id = ?1",
        host.0,
    )?;
    let signal_errors = count(
        conn,
        "SELECT COUNT(*) FROM test_signal_error s JOIN batch b ON b.id = s.batch_id
         WHERE b.testing_host_id = ?1",
        host.0,
    )?;
    Ok(failures + signal_errors)
}

pub fn count_successes_by_host(conn: &Connection, host: HostId) -> Result<u64> {
    count(
        conn,
        "SELECT COUNT(*) FROM test_success t JOIN batch b ON b.id = t.batch_id
         WHERE b.testing_host_id = ?1",
        host.0,
    )
}

/// Opcodes seen for `arch`, by name.
pub fn list_opcodes_for_arch(conn: &Connection, arch: ArchId) -> Result<Vec<Opcode>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM opcode WHERE arch_id = ?1 ORDER BY name",
        OPCODE_COLUMNS
    ))?;
    let opcodes = stmt
        .query_map(params![arch.0], opcode_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(opcodes)
}

pub fn get_opcode(conn: &Connection, id: OpcodeId) -> Result<Option<Opcode>> {
    Ok(conn
        .prepare_cached(&format!("SELECT {} FROM opcode WHERE id = ?1", OPCODE_COLUMNS))?
        .query_row(params![id.0], opcode_from_row)
        .optional()?)
}

pub fn count_by_outcome_for_opcode(conn: &Connection, opcode: OpcodeId) -> Result<OutcomeCounts> {
    Ok(OutcomeCounts {
        failures: count(
            conn,
            "SELECT COUNT(*) FROM test_failure WHERE opcode_id = ?1",
            opcode.0,
        )?,
        successes: count(
            conn,
            "SELECT COUNT(*) FROM test_success WHERE opcode_id = ?1",
            opcode.0,
        )?,
        signal_errors: count(
            conn,
            "SELECT COUNT(*) FROM test_signal_error WHERE opcode_id = ?1",
            opcode.0,
        )?,
    })
}

pub fn list_failures_for_opcode(conn: &Connection, opcode: OpcodeId) -> Result<Vec<TestFailureRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM test_failure WHERE opcode_id = ?1 ORDER BY id",
        FAILURE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![opcode.0], failure_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_signal_errors_for_opcode(
    conn: &Connection,
    opcode: OpcodeId,
) -> Result<Vec<TestSignalErrorRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM test_signal_error WHERE opcode_id = ?1 ORDER BY id",
        SIGNAL_ERROR_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![opcode.0], signal_error_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn get_batch(conn: &Connection, id: i64) -> Result<BatchRecord> {
    Ok(conn
        .prepare_cached(&format!("SELECT {} FROM batch WHERE id = ?1", BATCH_COLUMNS))?
        .query_row(params![id], batch_from_row)?)
}

fn get_opcode_row(conn: &Connection, id: OpcodeId) -> Result<Opcode> {
    Ok(conn
        .prepare_cached(&format!("SELECT {} FROM opcode WHERE id = ?1", OPCODE_COLUMNS))?
        .query_row(params![id.0], opcode_from_row)?)
}

/// A failure with its state rows and inputs in recorded order.
pub fn get_failure(conn: &Connection, id: FailureId) -> Result<Option<FailureDetail>> {
    let failure = conn
        .prepare_cached(&format!("SELECT {} FROM test_failure WHERE id = ?1", FAILURE_COLUMNS))?
        .query_row(params![id.0], failure_from_row)
        .optional()?;
    let Some(failure) = failure else {
        return Ok(None);
    };

    let state = conn
        .prepare_cached(
            "SELECT location, expected_value, actual_value FROM test_failure_state
             WHERE test_failure_id = ?1 ORDER BY seq",
        )?
        .query_map(params![id.0], |row| {
            Ok(FailureStateRow {
                location: row.get(0)?,
                expected_value: row.get(1)?,
                actual_value: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let inputs = conn
        .prepare_cached(
            "SELECT location, value FROM test_failure_input
             WHERE test_failure_id = ?1 ORDER BY seq",
        )?
        .query_map(params![id.0], |row| {
            Ok(FailureInputRow {
                location: row.get(0)?,
                value: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(FailureDetail {
        opcode: get_opcode_row(conn, failure.opcode_id)?,
        batch: get_batch(conn, failure.batch_id.0)?,
        failure,
        state,
        inputs,
    }))
}

/// A signal error with its inputs in recorded order.
pub fn get_signal_error(conn: &Connection, id: SignalErrorId) -> Result<Option<SignalErrorDetail>> {
    let signal_error = conn
        .prepare_cached(&format!(
            "SELECT {} FROM test_signal_error WHERE id = ?1",
            SIGNAL_ERROR_COLUMNS
        ))?
        .query_row(params![id.0], signal_error_from_row)
        .optional()?;
    let Some(signal_error) = signal_error else {
        return Ok(None);
    };

    let inputs = conn
        .prepare_cached(
            "SELECT location, value FROM test_signal_error_input
             WHERE test_signal_error_id = ?1 ORDER BY seq",
        )?
        .query_map(params![id.0], |row| {
            Ok(SignalErrorInputRow {
                location: row.get(0)?,
                value: row.get(1)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(SignalErrorDetail {
        opcode: get_opcode_row(conn, signal_error.opcode_id)?,
        batch: get_batch(conn, signal_error.batch_id.0)?,
        signal_error,
        inputs,
    }))
}

/// Every arch with per-host activity, for the overview page.
pub fn arch_overview(conn: &Connection) -> Result<Vec<ArchOverview>> {
    list_archs(conn)?
        .into_iter()
        .map(|arch| {
            let hosts = list_hosts_for_arch(conn, arch.id)?
                .into_iter()
                .map(|host| {
                    let activity = batch_activity_for_host(conn, host.id)?;
                    Ok(HostSummary {
                        num_failures: count_failures_by_host(conn, host.id)?,
                        num_successes: count_successes_by_host(conn, host.id)?,
                        batch_count: activity.batch_count,
                        last_batch_time: activity.last_batch_time,
                        host,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ArchOverview { arch, hosts })
        })
        .collect()
}

/// Per-opcode totals for `arch`, sorted for display.
///
/// Ties keep name order; descending order reverses the whole list.
pub fn opcode_statuses(
    conn: &Connection,
    arch: ArchId,
    sort: OpcodeSort,
    dir: SortDir,
) -> Result<Vec<OpcodeStatus>> {
    let mut statuses = list_opcodes_for_arch(conn, arch)?
        .into_iter()
        .map(|opcode| {
            let counts = count_by_outcome_for_opcode(conn, opcode.id)?;
            Ok(OpcodeStatus::new(opcode, counts))
        })
        .collect::<Result<Vec<_>>>()?;

    statuses.sort_by(|a, b| sort.compare(a, b));
    if dir == SortDir::Desc {
        statuses.reverse();
    }
    Ok(statuses)
}

/// The arch page, or `None` if no such arch exists.
pub fn arch_view(
    conn: &Connection,
    id: ArchId,
    sort: OpcodeSort,
    dir: SortDir,
) -> Result<Option<ArchView>> {
    let Some(arch) = get_arch(conn, id)? else {
        return Ok(None);
    };
    Ok(Some(ArchView {
        opcode_statuses: opcode_statuses(conn, arch.id, sort, dir)?,
        arch,
        sort_order: sort,
        dir,
        flipdir: dir.flip(),
    }))
}

/// The opcode page, or `None` if no such opcode exists.
pub fn opcode_view(
    conn: &Connection,
    id: OpcodeId,
    numeric_display: DisplayMode,
) -> Result<Option<OpcodeView>> {
    let Some(opcode) = get_opcode(conn, id)? else {
        return Ok(None);
    };
    Ok(Some(OpcodeView {
        counts: count_by_outcome_for_opcode(conn, opcode.id)?,
        failures: list_failures_for_opcode(conn, opcode.id)?,
        signal_errors: list_signal_errors_for_opcode(conn, opcode.id)?,
        opcode,
        numeric_display,
    }))
}
