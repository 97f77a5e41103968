//! Periodic CDR reconciliation.
//!
//! Webhooks get dropped: provider outages, deploys, transient network
//! failures. This loop periodically pulls the provider's CDR history from
//! the persisted cursor forward and replays it through the same normalizer
//! and state store as the webhook path, healing any missed calls. Because
//! the store's merge is idempotent, re-pulling already-applied records is
//! harmless noise.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};

use switchboard_db::{self as db, DbError, DbPool};
use switchboard_pbx::{CdrPage, PbxClient, PbxError};
use switchboard_types::EventOrigin;

use crate::normalize::normalize;
use crate::store::{AppliedCall, ApplyOutcome, StateStore, StoreError};

/// Re-pull a little before the cursor so boundary records and modest clock
/// skew between us and the provider cannot open a gap.
const CURSOR_OVERLAP_SECS: i64 = 60;

/// Provider timestamp format for CDR search windows.
const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Abstraction over the provider's paged CDR search, so the loop can be
/// exercised against a scripted source in tests.
pub trait CdrSource: Send + Sync + 'static {
    fn cdr_page(
        &self,
        start_time: &str,
        end_time: &str,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<CdrPage, PbxError>> + Send;
}

impl CdrSource for PbxClient {
    fn cdr_page(
        &self,
        start_time: &str,
        end_time: &str,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<CdrPage, PbxError>> + Send {
        PbxClient::cdr_page(self, start_time, end_time, page, page_size)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Seconds between successful reconciliation passes.
    pub interval_secs: u64,
    /// Backoff ceiling when the provider is unavailable.
    pub max_interval_secs: u64,
    /// Records per CDR search page.
    pub page_size: u32,
    /// How far back the very first pass looks when no cursor exists yet.
    pub lookback_secs: i64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_interval_secs: 1800,
            page_size: 100,
            lookback_secs: 3600,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("provider pull failed: {0}")]
    Provider(#[from] PbxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("cursor task failed: {0}")]
    Task(String),
}

impl ReconcileError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Counters from one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Records pulled from the provider.
    pub pulled: usize,
    /// Records that changed state when replayed.
    pub applied: usize,
    /// Records the store already knew everything about.
    pub stale: usize,
    /// Records the normalizer rejected.
    pub malformed: usize,
}

/// The reconciliation service. Owns the cursor and drives the pull loop;
/// every applied record is forwarded on `outcomes` so the server can fan it
/// out to subscribers and enqueue post-call processing.
pub struct ReconcileService<S: CdrSource> {
    source: Arc<S>,
    store: Arc<StateStore>,
    pool: DbPool,
    config: ReconcileConfig,
    outcomes: mpsc::Sender<AppliedCall>,
}

impl<S: CdrSource> ReconcileService<S> {
    pub fn new(
        source: Arc<S>,
        store: Arc<StateStore>,
        pool: DbPool,
        config: ReconcileConfig,
        outcomes: mpsc::Sender<AppliedCall>,
    ) -> Self {
        Self {
            source,
            store,
            pool,
            config,
            outcomes,
        }
    }

    /// Runs reconciliation until `shutdown` flips to true. Sleeps first so a
    /// crash loop cannot hammer the provider, and doubles the pause up to
    /// the configured ceiling while the provider stays unavailable.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let base = Duration::from_secs(self.config.interval_secs);
        let ceiling = Duration::from_secs(self.config.max_interval_secs);
        let mut pause = base;

        loop {
            tokio::select! {
                _ = sleep(pause) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("reconciliation loop stopping");
                        return;
                    }
                }
            }

            match self.run_once().await {
                Ok(stats) => {
                    if stats.applied > 0 {
                        tracing::info!(
                            pulled = stats.pulled,
                            applied = stats.applied,
                            stale = stats.stale,
                            malformed = stats.malformed,
                            "reconciliation pass healed records"
                        );
                    } else {
                        tracing::debug!(pulled = stats.pulled, "reconciliation pass clean");
                    }
                    pause = base;
                }
                Err(e) if e.is_retryable() => {
                    pause = (pause * 2).min(ceiling);
                    tracing::warn!(
                        retry_in_secs = pause.as_secs(),
                        "reconciliation pull failed, backing off: {e}"
                    );
                }
                Err(e) => {
                    pause = base;
                    tracing::error!("reconciliation pass failed: {e}");
                }
            }
        }
    }

    /// One reconciliation pass: pull the window from the cursor to now,
    /// replay every record, then advance the cursor. The cursor only moves
    /// after the whole batch applied, so a failure mid-window re-pulls it.
    pub async fn run_once(&self) -> Result<ReconcileStats, ReconcileError> {
        let now = Utc::now();
        let window_start = match self.load_cursor().await? {
            Some(cursor) => cursor - ChronoDuration::seconds(CURSOR_OVERLAP_SECS),
            None => now - ChronoDuration::seconds(self.config.lookback_secs),
        };

        let start_str = window_start.format(WINDOW_FORMAT).to_string();
        let end_str = now.format(WINDOW_FORMAT).to_string();

        let mut stats = ReconcileStats::default();
        let mut latest_record_time: Option<DateTime<Utc>> = None;
        let mut page = 1u32;
        loop {
            let batch = self
                .source
                .cdr_page(&start_str, &end_str, page, self.config.page_size)
                .await?;
            if batch.records.is_empty() {
                break;
            }
            stats.pulled += batch.records.len();

            for record in &batch.records {
                self.replay_record(record, &mut stats, &mut latest_record_time)
                    .await?;
            }

            if (page as u64) * (self.config.page_size as u64) >= batch.total {
                break;
            }
            page += 1;
        }

        // Advance to the newest record seen, falling back to the window end
        // when the window was empty.
        self.save_cursor(latest_record_time.unwrap_or(now)).await?;
        Ok(stats)
    }

    async fn replay_record(
        &self,
        record: &Value,
        stats: &mut ReconcileStats,
        latest: &mut Option<DateTime<Utc>>,
    ) -> Result<(), ReconcileError> {
        let events = match normalize(EventOrigin::PollDiff, record) {
            Ok(events) => events,
            Err(e) => {
                stats.malformed += 1;
                tracing::warn!("dropping malformed CDR record: {e}");
                return Ok(());
            }
        };

        for event in events {
            if let switchboard_types::NormalizedEvent::Call(call_event) = &event {
                if let Some(ts) = call_event.start_time {
                    if latest.is_none_or(|current| ts > current) {
                        *latest = Some(ts);
                    }
                }
            }

            match self.store.apply_event(event).await? {
                ApplyOutcome::Applied(applied) => {
                    stats.applied += 1;
                    // A closed receiver just means the server is shutting
                    // down; the records are already persisted.
                    if self.outcomes.send(applied).await.is_err() {
                        tracing::debug!("outcome receiver closed, not forwarding");
                    }
                }
                ApplyOutcome::Stale { .. } => stats.stale += 1,
                ApplyOutcome::ExtensionUpdated(_) => {}
            }
        }
        Ok(())
    }

    async fn load_cursor(&self) -> Result<Option<DateTime<Utc>>, ReconcileError> {
        let pool = self.pool.clone();
        let raw = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            db::get_sync_cursor(&conn)
        })
        .await
        .map_err(|e| ReconcileError::Task(e.to_string()))??;

        match raw {
            None => Ok(None),
            Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
                Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
                Err(e) => {
                    // A bad cursor falls back to the lookback window rather
                    // than wedging the loop.
                    tracing::warn!(cursor = %raw, "discarding unparseable sync cursor: {e}");
                    Ok(None)
                }
            },
        }
    }

    async fn save_cursor(&self, at: DateTime<Utc>) -> Result<(), ReconcileError> {
        let pool = self.pool.clone();
        let value = at.to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            db::set_sync_cursor(&conn, &value)
        })
        .await
        .map_err(|e| ReconcileError::Task(e.to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use switchboard_types::{CallStatus, NormalizedEvent};

    /// Scripted source: returns the queued pages in order, one per call.
    struct ScriptedSource {
        pages: Mutex<Vec<Result<CdrPage, PbxError>>>,
        windows: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<CdrPage, PbxError>>) -> Self {
            Self {
                pages: Mutex::new(pages),
                windows: Mutex::new(Vec::new()),
            }
        }
    }

    impl CdrSource for ScriptedSource {
        async fn cdr_page(
            &self,
            start_time: &str,
            end_time: &str,
            _page: u32,
            _page_size: u32,
        ) -> Result<CdrPage, PbxError> {
            self.windows
                .lock()
                .unwrap()
                .push((start_time.to_string(), end_time.to_string()));
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(CdrPage {
                    records: Vec::new(),
                    total: 0,
                })
            } else {
                pages.remove(0)
            }
        }
    }

    fn cloud_record(uid: &str, time: &str) -> Value {
        json!({
            "uid": uid,
            "call_type": "Inbound",
            "disposition": "ANSWERED",
            "time": time,
            "call_from_number": "+971501234567",
            "call_to_number": "201",
            "duration": 42,
            "record_file": format!("{uid}.wav"),
        })
    }

    async fn test_fixture(
        pages: Vec<Result<CdrPage, PbxError>>,
    ) -> (
        tempfile::TempDir,
        ReconcileService<ScriptedSource>,
        mpsc::Receiver<AppliedCall>,
        Arc<StateStore>,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reconcile-test.db");
        let pool = switchboard_db::create_pool(
            path.to_str().expect("utf-8 path"),
            switchboard_db::DbRuntimeSettings::default(),
        )
        .expect("test pool");
        {
            let conn = pool.get().expect("connection");
            switchboard_db::run_migrations(&conn).expect("migrations");
        }

        let store = Arc::new(StateStore::load(pool.clone()).await.expect("store"));
        let (tx, rx) = mpsc::channel(32);
        let service = ReconcileService::new(
            Arc::new(ScriptedSource::new(pages)),
            Arc::clone(&store),
            pool,
            ReconcileConfig::default(),
            tx,
        );
        (dir, service, rx, store)
    }

    #[tokio::test]
    async fn backfills_calls_whose_webhooks_were_missed() {
        let page = CdrPage {
            records: vec![
                cloud_record("c-10", "2026-08-30 10:00:00"),
                cloud_record("c-11", "2026-08-30 10:05:00"),
            ],
            total: 2,
        };
        let (_dir, service, mut rx, store) = test_fixture(vec![Ok(page)]).await;

        let stats = service.run_once().await.expect("pass should succeed");
        assert_eq!(stats.pulled, 2);
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.malformed, 0);

        let call = store.snapshot_call("c-10").expect("backfilled");
        assert_eq!(call.status, CallStatus::Ended);
        assert_eq!(call.duration, 42);
        assert_eq!(call.recording.as_deref(), Some("c-10.wav"));

        let first = rx.recv().await.expect("outcome forwarded");
        assert!(first.created);
        assert!(first.ready_for_pipeline);
    }

    #[tokio::test]
    async fn replaying_the_same_window_is_idempotent() {
        let page = CdrPage {
            records: vec![cloud_record("c-20", "2026-08-30 09:00:00")],
            total: 1,
        };
        let (_dir, service, _rx, _store) =
            test_fixture(vec![Ok(page.clone()), Ok(page)]).await;

        let first = service.run_once().await.expect("first pass");
        assert_eq!(first.applied, 1);

        let second = service.run_once().await.expect("second pass");
        assert_eq!(second.applied, 0);
        assert_eq!(second.stale, 1);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let page = CdrPage {
            records: vec![
                json!({"disposition": "BUSY"}),
                cloud_record("c-30", "2026-08-30 11:00:00"),
            ],
            total: 2,
        };
        let (_dir, service, _rx, store) = test_fixture(vec![Ok(page)]).await;

        let stats = service.run_once().await.expect("pass should succeed");
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.applied, 1);
        assert!(store.snapshot_call("c-30").is_some());
    }

    #[tokio::test]
    async fn cursor_advances_to_newest_record() {
        let page = CdrPage {
            records: vec![cloud_record("c-40", "2026-08-30 12:34:56")],
            total: 1,
        };
        let (_dir, service, _rx, _store) = test_fixture(vec![Ok(page)]).await;
        service.run_once().await.expect("pass");

        let cursor = service.load_cursor().await.expect("cursor").expect("set");
        assert_eq!(
            cursor.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2026-08-30 12:34:56"
        );
    }

    #[tokio::test]
    async fn provider_failure_propagates_as_retryable() {
        let (_dir, service, _rx, _store) =
            test_fixture(vec![Err(PbxError::Unavailable("timeout".into()))]).await;

        let err = service.run_once().await.expect_err("should fail");
        assert!(err.is_retryable());

        // The cursor must not move on a failed pass.
        assert!(service.load_cursor().await.expect("ok").is_none());
    }

    #[tokio::test]
    async fn first_window_uses_the_lookback() {
        let (_dir, service, _rx, _store) = test_fixture(vec![]).await;
        service.run_once().await.expect("pass");

        let windows = service.source.windows.lock().unwrap();
        let (start, end) = windows.first().expect("one pull").clone();
        assert!(start < end, "window must be ordered: {start} .. {end}");
    }
}
