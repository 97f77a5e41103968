//! Database layer for the Switchboard platform.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the persistence helpers for call, extension,
//! and call-summary records plus the reconciliation cursor.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: one server process owns the database; WAL
//!   allows concurrent readers with a single writer, matching the
//!   single-writer discipline of the state store.
//! - **`r2d2` connection pool**: bounded connection reuse without manual
//!   lifetime management. All callers in async contexts wrap their database
//!   work in `tokio::task::spawn_blocking`.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!`, so the schema ships with the code that depends on it.

mod calls;
mod contacts;
mod cursor;
mod error;
mod extensions;
mod migrations;
mod pool;
mod summaries;
mod timefmt;

pub use calls::{get_call, list_recent_calls, load_open_calls, upsert_call};
pub use contacts::{insert_contact, lookup_contact};
pub use cursor::{get_sync_cursor, set_sync_cursor};
pub use error::DbError;
pub use extensions::{get_extension, list_extensions, load_all_extensions, upsert_extension};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
pub use summaries::{
    complete_summary, create_pending_summary, fail_summary, get_summary, list_summaries,
    load_resumable_summaries, record_audio_path, record_transcript, reset_summary_for_retry,
    set_summary_stage,
};
