//! Error type for the database layer.

use thiserror::Error;

/// Errors surfaced by persistence helpers.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to check a connection out of the pool.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A JSON column could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value does not parse back into its domain type.
    /// Indicates external tampering or a schema/code mismatch.
    #[error("corrupt column {column}: {value:?}")]
    CorruptColumn { column: &'static str, value: String },
}
