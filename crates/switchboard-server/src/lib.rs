//! HTTP/WebSocket server tying the sync layer, the PBX client, and the
//! post-call pipeline together behind one router.

pub mod api_rest;
pub mod api_webhook;
pub mod api_ws;
pub mod background;
pub mod config;

use std::sync::Arc;

use axum::{
    extract::Extension,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use switchboard_db::DbPool;
use switchboard_pbx::PbxClient;
use switchboard_pipeline::{OllamaSummarizer, Pipeline, SttService};
use switchboard_sync::{AppliedCall, StateStore};

use crate::api_ws::{OutgoingEvent, SubscriberHub};

/// The pipeline as instantiated in production: recordings fetched through
/// the shared PBX client, local whisper transcription, Ollama summaries.
pub type AppPipeline = Pipeline<Arc<PbxClient>, SttService, OllamaSummarizer>;

/// Shared application state, passed to handlers via an `Extension` layer.
pub struct AppState {
    pub pool: DbPool,
    pub store: Arc<StateStore>,
    pub pbx: Arc<PbxClient>,
    pub hub: SubscriberHub,
    pub pipeline: AppPipeline,
    /// Shared secret required by the webhook and WebSocket surfaces.
    pub api_token: String,
    /// Whether extension-to-extension calls enter the pipeline.
    pub process_internal: bool,
}

/// Builds the router with all routes and middleware.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/pbx", post(api_webhook::pbx_event_handler))
        .route("/webhooks/pbx/cdr", post(api_webhook::pbx_cdr_handler))
        .route("/ws", get(api_ws::ws_handler))
        .route("/api/calls", get(api_rest::list_calls_handler))
        .route("/api/calls/active", get(api_rest::active_calls_handler))
        .route("/api/calls/{call_id}", get(api_rest::get_call_handler))
        .route("/api/extensions", get(api_rest::list_extensions_handler))
        .route("/api/summaries", get(api_rest::list_summaries_handler))
        .route("/api/summaries/{call_id}", get(api_rest::get_summary_handler))
        .route(
            "/api/summaries/{call_id}/retry",
            post(api_rest::retry_summary_handler),
        )
        .route("/api/pipeline/status", get(api_rest::pipeline_status_handler))
        .layer(Extension(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Publishes an applied call event to WebSocket subscribers and, when the
/// call just reached a terminal state with a recording attached, hands it
/// to the post-call pipeline.
pub async fn publish_applied(state: &AppState, update: &AppliedCall) {
    if let Some(extension) = &update.extension {
        state
            .hub
            .broadcast(&OutgoingEvent::ExtensionUpdated {
                extension: extension.clone(),
            })
            .await;
    }
    state
        .hub
        .broadcast(&OutgoingEvent::CallUpdated {
            call: update.call.clone(),
        })
        .await;

    if update.ready_for_pipeline {
        if update.call.direction == switchboard_types::CallDirection::Internal
            && !state.process_internal
        {
            tracing::debug!(call_id = %update.call.call_id, "internal call, skipping pipeline");
            return;
        }
        if update.call.status != switchboard_types::CallStatus::Ended {
            tracing::debug!(
                call_id = %update.call.call_id,
                status = update.call.status.as_str(),
                "call was not answered, skipping pipeline"
            );
            return;
        }
        if let Some(recording) = &update.call.recording {
            match state.pipeline.enqueue(&update.call.call_id, recording).await {
                Ok(true) => {
                    tracing::info!(call_id = %update.call.call_id, "recording queued for post-call pipeline");
                }
                Ok(false) => {
                    tracing::debug!(call_id = %update.call.call_id, "pipeline job already exists");
                }
                Err(e) => {
                    tracing::error!(call_id = %update.call.call_id, "failed to enqueue pipeline job: {e}");
                }
            }
        }
    }
}
