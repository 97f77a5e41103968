//! Persistence for transcription pipeline jobs.
//!
//! These rows are owned exclusively by the pipeline. The stage column is
//! written before a stage's work begins and artifact columns (`audio_path`,
//! `transcript`) as soon as they exist, so a restart resumes from the first
//! incomplete stage instead of repeating completed work.

use rusqlite::{params, Connection, OptionalExtension, Row};
use switchboard_types::{
    CallCategory, CallSummary, PipelineStatus, Sentiment, SummaryFields,
};

use crate::error::DbError;
use crate::timefmt;

/// Creates a `pending` job row for `call_id` if none exists yet.
///
/// Returns `true` when the row was created, `false` when a row (in any
/// state) already existed — the caller treats that as "already enqueued or
/// settled" and does not enqueue again.
pub fn create_pending_summary(
    conn: &Connection,
    call_id: &str,
    recording: &str,
) -> Result<bool, DbError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO call_summaries (call_id, recording) VALUES (?1, ?2)",
        params![call_id, recording],
    )?;
    Ok(inserted > 0)
}

/// Looks up a job by call id.
pub fn get_summary(conn: &Connection, call_id: &str) -> Result<Option<CallSummary>, DbError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM call_summaries WHERE call_id = ?1"),
        [call_id],
        row_to_summary,
    )
    .optional()?
    .transpose()
}

/// Moves a job to a new stage, optionally counting it as a fresh attempt.
pub fn set_summary_stage(
    conn: &Connection,
    call_id: &str,
    status: PipelineStatus,
    new_attempt: bool,
) -> Result<(), DbError> {
    if new_attempt {
        conn.execute(
            "UPDATE call_summaries
             SET status = ?2, attempts = attempts + 1,
                 last_attempt_at = datetime('now'), updated_at = datetime('now')
             WHERE call_id = ?1",
            params![call_id, status.as_str()],
        )?;
    } else {
        conn.execute(
            "UPDATE call_summaries
             SET status = ?2, updated_at = datetime('now')
             WHERE call_id = ?1",
            params![call_id, status.as_str()],
        )?;
    }
    Ok(())
}

/// Records the scratch path of the downloaded audio artifact.
pub fn record_audio_path(conn: &Connection, call_id: &str, path: &str) -> Result<(), DbError> {
    conn.execute(
        "UPDATE call_summaries
         SET audio_path = ?2, updated_at = datetime('now')
         WHERE call_id = ?1",
        params![call_id, path],
    )?;
    Ok(())
}

/// Records the transcript artifact.
pub fn record_transcript(
    conn: &Connection,
    call_id: &str,
    transcript: &str,
) -> Result<(), DbError> {
    conn.execute(
        "UPDATE call_summaries
         SET transcript = ?2, updated_at = datetime('now')
         WHERE call_id = ?1",
        params![call_id, transcript],
    )?;
    Ok(())
}

/// Writes the summarizer output and marks the job `done`.
///
/// A single UPDATE keeps the status flip atomic with the content fields:
/// no reader ever observes `done` with partially-written output.
pub fn complete_summary(
    conn: &Connection,
    call_id: &str,
    fields: &SummaryFields,
) -> Result<(), DbError> {
    let topics = serde_json::to_string(&fields.topics)?;
    let action_items = serde_json::to_string(&fields.action_items)?;
    conn.execute(
        "UPDATE call_summaries
         SET status = 'done', category = ?2, sentiment = ?3, topics = ?4,
             action_items = ?5, failure_reason = NULL, updated_at = datetime('now')
         WHERE call_id = ?1",
        params![
            call_id,
            fields.category.as_str(),
            fields.sentiment.as_str(),
            topics,
            action_items,
        ],
    )?;
    Ok(())
}

/// Marks the job permanently failed with a human-readable reason.
/// Artifacts are preserved for manual retry.
pub fn fail_summary(conn: &Connection, call_id: &str, reason: &str) -> Result<(), DbError> {
    conn.execute(
        "UPDATE call_summaries
         SET status = 'failed', failure_reason = ?2, updated_at = datetime('now')
         WHERE call_id = ?1",
        params![call_id, reason],
    )?;
    Ok(())
}

/// Re-arms a failed job for another run, keeping its artifacts.
///
/// Returns `false` if the job does not exist or is not in the `failed`
/// state — in-flight and completed jobs cannot be re-triggered.
pub fn reset_summary_for_retry(conn: &Connection, call_id: &str) -> Result<bool, DbError> {
    let updated = conn.execute(
        "UPDATE call_summaries
         SET status = 'pending', failure_reason = NULL, attempts = 0,
             updated_at = datetime('now')
         WHERE call_id = ?1 AND status = 'failed'",
        [call_id],
    )?;
    Ok(updated > 0)
}

/// Loads every job that has neither finished nor permanently failed.
///
/// Called once on startup to re-enqueue work interrupted by a shutdown;
/// each job's persisted stage and artifacts determine where it resumes.
pub fn load_resumable_summaries(conn: &Connection) -> Result<Vec<CallSummary>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM call_summaries
         WHERE status NOT IN ('done', 'failed')
         ORDER BY created_at"
    ))?;
    let rows = stmt.query_map([], row_to_summary)?;
    collect(rows)
}

/// Returns the most recently updated jobs, newest first.
pub fn list_summaries(conn: &Connection, limit: i64) -> Result<Vec<CallSummary>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM call_summaries ORDER BY updated_at DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map([limit], row_to_summary)?;
    collect(rows)
}

const COLUMNS: &str = "call_id, recording, status, audio_path, transcript, category, \
    sentiment, topics, action_items, failure_reason, attempts, last_attempt_at, \
    created_at, updated_at";

fn collect(
    rows: impl Iterator<Item = rusqlite::Result<Result<CallSummary, DbError>>>,
) -> Result<Vec<CallSummary>, DbError> {
    let mut summaries = Vec::new();
    for row in rows {
        summaries.push(row??);
    }
    Ok(summaries)
}

fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<Result<CallSummary, DbError>> {
    let status_raw: String = row.get(2)?;
    let category_raw: Option<String> = row.get(5)?;
    let sentiment_raw: Option<String> = row.get(6)?;
    let topics_raw: String = row.get(7)?;
    let action_items_raw: String = row.get(8)?;
    let last_attempt_raw: Option<String> = row.get(11)?;
    let created_raw: String = row.get(12)?;
    let updated_raw: String = row.get(13)?;

    let call_id: String = row.get(0)?;
    let recording: String = row.get(1)?;
    let audio_path: Option<String> = row.get(3)?;
    let transcript: Option<String> = row.get(4)?;
    let failure_reason: Option<String> = row.get(9)?;
    let attempts: i64 = row.get(10)?;

    Ok((|| {
        let status = PipelineStatus::parse(&status_raw).ok_or_else(|| DbError::CorruptColumn {
            column: "call_summaries.status",
            value: status_raw.clone(),
        })?;
        let topics: Vec<String> = serde_json::from_str(&topics_raw)?;
        let action_items: Vec<String> = serde_json::from_str(&action_items_raw)?;
        Ok(CallSummary {
            call_id,
            recording,
            status,
            audio_path,
            transcript,
            category: category_raw.as_deref().map(CallCategory::parse_lossy),
            sentiment: sentiment_raw.as_deref().map(Sentiment::parse_lossy),
            topics,
            action_items,
            failure_reason,
            attempts: attempts as u32,
            last_attempt_at: timefmt::from_optional(
                "call_summaries.last_attempt_at",
                last_attempt_raw,
            )?,
            created_at: parse_sqlite_now("call_summaries.created_at", &created_raw)?,
            updated_at: parse_sqlite_now("call_summaries.updated_at", &updated_raw)?,
        })
    })())
}

/// `datetime('now')` columns come back as `YYYY-MM-DD HH:MM:SS` (UTC);
/// accept both that and RFC 3339.
fn parse_sqlite_now(
    column: &'static str,
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>, DbError> {
    use chrono::{NaiveDateTime, TimeZone, Utc};
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    timefmt::from_column(column, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use switchboard_types::{CallCategory, Sentiment};

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        crate::run_migrations(&conn).expect("migrations should succeed");
        conn
    }

    #[test]
    fn create_pending_is_idempotent() {
        let conn = test_db();
        assert!(create_pending_summary(&conn, "c-100", "rec-100.wav").unwrap());
        assert!(!create_pending_summary(&conn, "c-100", "rec-100.wav").unwrap());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM call_summaries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1, "at most one row per call id");
    }

    #[test]
    fn stage_and_artifacts_persist() {
        let conn = test_db();
        create_pending_summary(&conn, "c-1", "rec.wav").unwrap();
        set_summary_stage(&conn, "c-1", PipelineStatus::Downloading, true).unwrap();
        record_audio_path(&conn, "c-1", "/tmp/rec.wav").unwrap();
        set_summary_stage(&conn, "c-1", PipelineStatus::Transcribing, false).unwrap();

        let job = get_summary(&conn, "c-1").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Transcribing);
        assert_eq!(job.audio_path.as_deref(), Some("/tmp/rec.wav"));
        assert_eq!(job.attempts, 1);
        assert!(job.last_attempt_at.is_some());
    }

    #[test]
    fn complete_writes_all_fields_and_done() {
        let conn = test_db();
        create_pending_summary(&conn, "c-2", "rec.wav").unwrap();
        record_transcript(&conn, "c-2", "hello, I need a quote").unwrap();

        let fields = SummaryFields {
            category: CallCategory::Sales,
            sentiment: Sentiment::Positive,
            topics: vec!["pricing".to_string()],
            action_items: vec!["send quotation".to_string()],
        };
        complete_summary(&conn, "c-2", &fields).unwrap();

        let job = get_summary(&conn, "c-2").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Done);
        assert_eq!(job.category, Some(CallCategory::Sales));
        assert_eq!(job.sentiment, Some(Sentiment::Positive));
        assert_eq!(job.topics, vec!["pricing"]);
        assert_eq!(job.action_items, vec!["send quotation"]);
        assert!(job.failure_reason.is_none());
    }

    #[test]
    fn retry_reset_only_applies_to_failed_jobs() {
        let conn = test_db();
        create_pending_summary(&conn, "c-3", "rec.wav").unwrap();
        record_audio_path(&conn, "c-3", "/tmp/rec.wav").unwrap();
        fail_summary(&conn, "c-3", "provider unavailable").unwrap();

        assert!(reset_summary_for_retry(&conn, "c-3").unwrap());
        let job = get_summary(&conn, "c-3").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Pending);
        assert_eq!(job.attempts, 0);
        // Artifacts survive the reset.
        assert_eq!(job.audio_path.as_deref(), Some("/tmp/rec.wav"));

        // A pending job cannot be re-triggered again.
        assert!(!reset_summary_for_retry(&conn, "c-3").unwrap());
        assert!(!reset_summary_for_retry(&conn, "missing").unwrap());
    }

    #[test]
    fn resumable_excludes_settled_jobs() {
        let conn = test_db();
        create_pending_summary(&conn, "c-pending", "a.wav").unwrap();
        create_pending_summary(&conn, "c-mid", "b.wav").unwrap();
        set_summary_stage(&conn, "c-mid", PipelineStatus::Transcribing, true).unwrap();
        create_pending_summary(&conn, "c-done", "c.wav").unwrap();
        complete_summary(&conn, "c-done", &SummaryFields::no_speech()).unwrap();
        create_pending_summary(&conn, "c-failed", "d.wav").unwrap();
        fail_summary(&conn, "c-failed", "nope").unwrap();

        let resumable = load_resumable_summaries(&conn).unwrap();
        let ids: Vec<_> = resumable.iter().map(|j| j.call_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"c-pending"));
        assert!(ids.contains(&"c-mid"));
    }
}
