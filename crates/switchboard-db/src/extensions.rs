//! Persistence for extension records.

use rusqlite::{params, Connection, OptionalExtension, Row};
use switchboard_types::{Extension, ExtensionStatus};

use crate::error::DbError;
use crate::timefmt;

/// Inserts or replaces the record for `ext.number`.
pub fn upsert_extension(conn: &Connection, ext: &Extension) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO extensions (
            number, name, status, registered, current_call_id, current_caller, last_seen
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT (number) DO UPDATE SET
            name = COALESCE(excluded.name, extensions.name),
            status = excluded.status,
            registered = excluded.registered,
            current_call_id = excluded.current_call_id,
            current_caller = excluded.current_caller,
            last_seen = excluded.last_seen,
            updated_at = datetime('now')",
        params![
            ext.number,
            ext.name,
            ext.status.as_str(),
            ext.registered as i64,
            ext.current_call_id,
            ext.current_caller,
            ext.last_seen.map(timefmt::to_column),
        ],
    )?;
    Ok(())
}

/// Looks up an extension by its dial-plan number.
pub fn get_extension(conn: &Connection, number: &str) -> Result<Option<Extension>, DbError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM extensions WHERE number = ?1"),
        [number],
        row_to_extension,
    )
    .optional()?
    .transpose()
}

/// Lists all extensions ordered by number.
pub fn list_extensions(conn: &Connection) -> Result<Vec<Extension>, DbError> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM extensions ORDER BY number"))?;
    let rows = stmt.query_map([], row_to_extension)?;
    let mut extensions = Vec::new();
    for row in rows {
        extensions.push(row??);
    }
    Ok(extensions)
}

/// Loads every extension for the state store's startup warm-up.
pub fn load_all_extensions(conn: &Connection) -> Result<Vec<Extension>, DbError> {
    list_extensions(conn)
}

const COLUMNS: &str =
    "number, name, status, registered, current_call_id, current_caller, last_seen";

fn row_to_extension(row: &Row<'_>) -> rusqlite::Result<Result<Extension, DbError>> {
    let status_raw: String = row.get(2)?;
    let last_seen_raw: Option<String> = row.get(6)?;

    let number: String = row.get(0)?;
    let name: Option<String> = row.get(1)?;
    let registered: i64 = row.get(3)?;
    let current_call_id: Option<String> = row.get(4)?;
    let current_caller: Option<String> = row.get(5)?;

    Ok((|| {
        let status = ExtensionStatus::parse(&status_raw).ok_or_else(|| DbError::CorruptColumn {
            column: "extensions.status",
            value: status_raw.clone(),
        })?;
        Ok(Extension {
            number,
            name,
            status,
            registered: registered != 0,
            current_call_id,
            current_caller,
            last_seen: timefmt::from_optional("extensions.last_seen", last_seen_raw)?,
        })
    })())
}
