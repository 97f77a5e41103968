//! Durable reconciliation cursor.
//!
//! The reconciliation loop advances this marker only after a whole CDR
//! batch has been applied, giving at-least-once delivery into the state
//! store across restarts; the store's idempotent merge absorbs replays.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::DbError;

const CDR_CURSOR: &str = "cdr_sync";

/// Returns the persisted CDR cursor, if a sync has ever completed.
pub fn get_sync_cursor(conn: &Connection) -> Result<Option<String>, DbError> {
    let value = conn
        .query_row(
            "SELECT value FROM sync_cursor WHERE name = ?1",
            [CDR_CURSOR],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Durably advances the CDR cursor.
pub fn set_sync_cursor(conn: &Connection, value: &str) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO sync_cursor (name, value) VALUES (?1, ?2)
         ON CONFLICT (name) DO UPDATE SET
            value = excluded.value,
            updated_at = datetime('now')",
        params![CDR_CURSOR, value],
    )?;
    Ok(())
}
