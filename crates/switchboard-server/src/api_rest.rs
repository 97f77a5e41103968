//! REST read surface: calls, extensions, summaries, pipeline status.
//!
//! Live views come straight from the in-memory state store; historical
//! views go to SQLite on the blocking pool. All list endpoints are
//! bounded so a dashboard cannot drag the whole history over the wire.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use switchboard_db::{self as db, DbPool};
use switchboard_types::{Call, CallSummary, Extension as ExtensionRecord};

use crate::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
}

impl ListParams {
    fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

/// `GET /api/calls?limit=N` — recent calls, newest first.
pub async fn list_calls_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Call>>, StatusCode> {
    let limit = params.limit();
    let calls = with_conn(&state.pool, move |conn| db::list_recent_calls(conn, limit)).await?;
    Ok(Json(calls))
}

/// `GET /api/calls/active` — calls not yet in a terminal state.
pub async fn active_calls_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<Call>> {
    Json(state.store.active_calls())
}

/// `GET /api/calls/{call_id}` — one call, live snapshot first, DB fallback.
pub async fn get_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<Call>, StatusCode> {
    if let Some(call) = state.store.snapshot_call(&call_id) {
        return Ok(Json(call));
    }
    let call = with_conn(&state.pool, move |conn| db::get_call(conn, &call_id)).await?;
    call.map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// `GET /api/extensions` — every known extension with live presence.
pub async fn list_extensions_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Json<Vec<ExtensionRecord>> {
    Json(state.store.extensions())
}

/// `GET /api/summaries?limit=N` — pipeline results, most recently updated
/// first.
pub async fn list_summaries_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<CallSummary>>, StatusCode> {
    let limit = params.limit();
    let summaries = with_conn(&state.pool, move |conn| db::list_summaries(conn, limit)).await?;
    Ok(Json(summaries))
}

/// `GET /api/summaries/{call_id}`
pub async fn get_summary_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<CallSummary>, StatusCode> {
    let summary = with_conn(&state.pool, move |conn| db::get_summary(conn, &call_id)).await?;
    summary.map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// `POST /api/summaries/{call_id}/retry` — re-run a failed pipeline job.
///
/// 202 when the job was reset and requeued, 404 when no job exists, 409
/// when the job is not in a failed state.
pub async fn retry_summary_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let reset = {
        let call_id = call_id.clone();
        with_conn(&state.pool, move |conn| {
            db::reset_summary_for_retry(conn, &call_id)
        })
        .await?
    };

    if !reset {
        let exists = {
            let call_id = call_id.clone();
            with_conn(&state.pool, move |conn| db::get_summary(conn, &call_id)).await?
        };
        return match exists {
            Some(_) => Err(StatusCode::CONFLICT),
            None => Err(StatusCode::NOT_FOUND),
        };
    }

    match state.pipeline.requeue(&call_id).await {
        Ok(_) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "queued", "call_id": call_id })),
        )),
        Err(e) => {
            tracing::error!(call_id = %call_id, "failed to requeue summary job: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// `GET /api/pipeline/status` — job counts per stage plus the number of
/// connected WebSocket subscribers.
pub async fn pipeline_status_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let counts = with_conn(&state.pool, |conn| {
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM call_summaries GROUP BY status")
            .map_err(db::DbError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db::DbError::from)?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row.map_err(db::DbError::from)?;
            counts.insert(status, count);
        }
        Ok(counts)
    })
    .await?;

    let subscribers = state.hub.session_count().await;
    Ok(Json(json!({
        "jobs": counts,
        "subscribers": subscribers,
    })))
}

/// Runs a closure against a pooled connection on the blocking pool,
/// collapsing every failure mode into a 500.
async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, StatusCode>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, db::DbError> + Send + 'static,
{
    let pool = pool.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(db::DbError::from)?;
        f(&conn)
    })
    .await;

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!("database query failed: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(e) => {
            tracing::error!("database task panicked: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
