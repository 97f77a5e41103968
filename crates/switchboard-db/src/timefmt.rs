//! Timestamp column helpers.
//!
//! Timestamps are stored as RFC 3339 text so rows stay readable in the
//! sqlite shell and sortable lexicographically.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::DbError;

pub(crate) fn to_column(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn from_column(column: &'static str, value: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| DbError::CorruptColumn {
            column,
            value: value.to_string(),
        })
}

pub(crate) fn from_optional(
    column: &'static str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, DbError> {
    value.map(|v| from_column(column, &v)).transpose()
}
