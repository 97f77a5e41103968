//! Persistence for call records.
//!
//! The state store is the single writer for this table; everything else
//! reads. `upsert_call` writes the full record — merging has already been
//! done in memory by the store, so persistence is a plain write-through.

use rusqlite::{params, Connection, OptionalExtension, Row};
use switchboard_types::{Call, CallDirection, CallStatus};

use crate::error::DbError;
use crate::timefmt;

/// Inserts or replaces the record for `call.call_id`.
pub fn upsert_call(conn: &Connection, call: &Call) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO calls (
            call_id, contact_id, caller_number, callee_number, caller_name,
            callee_name, direction, status, extension, trunk, start_time,
            answer_time, end_time, duration, ring_duration, recording, version
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT (call_id) DO UPDATE SET
            contact_id = excluded.contact_id,
            caller_number = excluded.caller_number,
            callee_number = excluded.callee_number,
            caller_name = excluded.caller_name,
            callee_name = excluded.callee_name,
            direction = excluded.direction,
            status = excluded.status,
            extension = excluded.extension,
            trunk = excluded.trunk,
            start_time = excluded.start_time,
            answer_time = excluded.answer_time,
            end_time = excluded.end_time,
            duration = excluded.duration,
            ring_duration = excluded.ring_duration,
            recording = excluded.recording,
            version = excluded.version,
            updated_at = datetime('now')",
        params![
            call.call_id,
            call.contact_id,
            call.caller_number,
            call.callee_number,
            call.caller_name,
            call.callee_name,
            call.direction.as_str(),
            call.status.as_str(),
            call.extension,
            call.trunk,
            timefmt::to_column(call.start_time),
            call.answer_time.map(timefmt::to_column),
            call.end_time.map(timefmt::to_column),
            call.duration,
            call.ring_duration,
            call.recording,
            call.version as i64,
        ],
    )?;
    Ok(())
}

/// Looks up a call by its provider id.
pub fn get_call(conn: &Connection, call_id: &str) -> Result<Option<Call>, DbError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM calls WHERE call_id = ?1"),
        [call_id],
        row_to_call,
    )
    .optional()?
    .transpose()
}

/// Returns the most recently started calls, newest first.
pub fn list_recent_calls(conn: &Connection, limit: i64) -> Result<Vec<Call>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM calls ORDER BY start_time DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map([limit], row_to_call)?;
    collect(rows)
}

/// Loads every call that has not yet reached a terminal status.
///
/// Used by the state store to warm its in-memory table on startup so
/// in-flight calls survive a restart.
pub fn load_open_calls(conn: &Connection) -> Result<Vec<Call>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM calls
         WHERE status IN ('ringing', 'answered', 'on_hold')"
    ))?;
    let rows = stmt.query_map([], row_to_call)?;
    collect(rows)
}

const COLUMNS: &str = "call_id, contact_id, caller_number, callee_number, caller_name, \
    callee_name, direction, status, extension, trunk, start_time, answer_time, \
    end_time, duration, ring_duration, recording, version";

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Result<Call, DbError>>>,
) -> Result<Vec<Call>, DbError> {
    let mut calls = Vec::new();
    for row in rows {
        calls.push(row??);
    }
    Ok(calls)
}

fn row_to_call(row: &Row<'_>) -> rusqlite::Result<Result<Call, DbError>> {
    // Column decoding that can fail on domain parsing is deferred into the
    // inner Result so rusqlite's row mapping stays infallible.
    let direction_raw: String = row.get(6)?;
    let status_raw: String = row.get(7)?;
    let start_raw: String = row.get(10)?;
    let answer_raw: Option<String> = row.get(11)?;
    let end_raw: Option<String> = row.get(12)?;

    let call_id: String = row.get(0)?;
    let contact_id: Option<i64> = row.get(1)?;
    let caller_number: String = row.get(2)?;
    let callee_number: String = row.get(3)?;
    let caller_name: Option<String> = row.get(4)?;
    let callee_name: Option<String> = row.get(5)?;
    let extension: Option<String> = row.get(8)?;
    let trunk: Option<String> = row.get(9)?;
    let duration: i64 = row.get(13)?;
    let ring_duration: i64 = row.get(14)?;
    let recording: Option<String> = row.get(15)?;
    let version: i64 = row.get(16)?;

    Ok((|| {
        let direction =
            CallDirection::parse(&direction_raw).ok_or_else(|| DbError::CorruptColumn {
                column: "calls.direction",
                value: direction_raw.clone(),
            })?;
        let status = CallStatus::parse(&status_raw).ok_or_else(|| DbError::CorruptColumn {
            column: "calls.status",
            value: status_raw.clone(),
        })?;
        Ok(Call {
            call_id,
            contact_id,
            caller_number,
            callee_number,
            caller_name,
            callee_name,
            direction,
            status,
            extension,
            trunk,
            start_time: timefmt::from_column("calls.start_time", &start_raw)?,
            answer_time: timefmt::from_optional("calls.answer_time", answer_raw)?,
            end_time: timefmt::from_optional("calls.end_time", end_raw)?,
            duration,
            ring_duration,
            recording,
            version: version as u64,
        })
    })())
}
