//! Webhook ingest endpoints.
//!
//! The PBX pushes live call progress, presence alerts, and CDRs here.
//! Payloads are authenticated by a shared-secret token, normalized, and
//! applied through the state store; anything the normalizer rejects is
//! logged and acknowledged with 200 so the provider does not retry
//! garbage forever.

use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use switchboard_sync::{normalize, ApplyOutcome};
use switchboard_types::EventOrigin;

use crate::{publish_applied, AppState};

#[derive(Debug, Deserialize)]
pub struct WebhookParams {
    pub token: Option<String>,
}

/// `POST /webhooks/pbx` — live call-progress, presence, and CDR pushes.
pub async fn pbx_event_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<WebhookParams>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    ingest(state, params, headers, EventOrigin::WebhookCall, payload).await
}

/// `POST /webhooks/pbx/cdr` — dedicated CDR push endpoint. Payloads here
/// need no event discriminator.
pub async fn pbx_cdr_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<WebhookParams>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    ingest(state, params, headers, EventOrigin::WebhookCdr, payload).await
}

async fn ingest(
    state: Arc<AppState>,
    params: WebhookParams,
    headers: HeaderMap,
    origin: EventOrigin,
    payload: Value,
) -> Response {
    if !token_ok(&state, &params, &headers) {
        tracing::warn!(origin = origin.as_str(), "webhook rejected: bad token");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let events = match normalize(origin, &payload) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(origin = origin.as_str(), "dropping malformed webhook: {e}");
            return (
                StatusCode::OK,
                Json(json!({ "status": "ignored", "reason": e.to_string() })),
            )
                .into_response();
        }
    };

    let mut applied = 0usize;
    let mut stale = 0usize;
    for event in events {
        match state.store.apply_event(event).await {
            Ok(ApplyOutcome::Applied(update)) => {
                applied += 1;
                publish_applied(&state, &update).await;
            }
            Ok(ApplyOutcome::ExtensionUpdated(extension)) => {
                applied += 1;
                state
                    .hub
                    .broadcast(&crate::api_ws::OutgoingEvent::ExtensionUpdated { extension })
                    .await;
            }
            Ok(ApplyOutcome::Stale { call_id }) => {
                stale += 1;
                tracing::debug!(call_id = %call_id, "webhook event was stale");
            }
            Err(e) => {
                tracing::error!(origin = origin.as_str(), "failed to apply webhook event: {e}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "applied": applied, "stale": stale })),
    )
        .into_response()
}

/// The token may arrive as a `token` query parameter or an
/// `X-Webhook-Token` header. An empty configured token disables the
/// webhook surface entirely rather than leaving it open.
fn token_ok(state: &AppState, params: &WebhookParams, headers: &HeaderMap) -> bool {
    if state.api_token.is_empty() {
        return false;
    }
    if params.token.as_deref() == Some(state.api_token.as_str()) {
        return true;
    }
    headers
        .get("x-webhook-token")
        .and_then(|v| v.to_str().ok())
        == Some(state.api_token.as_str())
}
