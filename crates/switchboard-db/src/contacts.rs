//! Contact directory lookup.
//!
//! Matching rule: strip everything except digits and `+`, require at least
//! four digits, then match the last ten digits against either stored phone
//! column. Lookup is decoration only — a miss never affects call state.

use rusqlite::{params, Connection, OptionalExtension};
use switchboard_types::Contact;

use crate::error::DbError;

/// Inserts a contact. Exposed for seeding and tests; contact CRUD proper
/// lives outside this layer.
pub fn insert_contact(
    conn: &Connection,
    name: &str,
    company: Option<&str>,
    phone: &str,
    phone_secondary: Option<&str>,
) -> Result<i64, DbError> {
    conn.execute(
        "INSERT INTO contacts (name, company, phone, phone_secondary)
         VALUES (?1, ?2, ?3, ?4)",
        params![name, company, phone, phone_secondary],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Finds the contact whose phone number matches `phone`, if any.
pub fn lookup_contact(conn: &Connection, phone: &str) -> Result<Option<Contact>, DbError> {
    let Some(suffix) = matchable_suffix(phone) else {
        return Ok(None);
    };

    let pattern = format!("%{suffix}%");
    let contact = conn
        .query_row(
            "SELECT id, name, company, phone FROM contacts
             WHERE phone LIKE ?1 OR phone_secondary LIKE ?1
             ORDER BY id LIMIT 1",
            [pattern],
            |row| {
                Ok(Contact {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    company: row.get(2)?,
                    phone: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(contact)
}

/// Normalizes a dialled number down to the suffix used for matching.
/// Returns `None` when the input has too few digits to match on.
fn matchable_suffix(phone: &str) -> Option<String> {
    let normalized: String = phone
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    let digits: Vec<char> = normalized.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    let start = digits.len().saturating_sub(10);
    Some(digits[start..].iter().collect())
}
