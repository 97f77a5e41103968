//! Background task wiring: extension seeding, CDR reconciliation, the
//! post-call pipeline, and the forwarders that turn their outputs into
//! WebSocket frames.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use switchboard_sync::{AppliedCall, ReconcileConfig, ReconcileService};
use switchboard_types::CallSummary;

use crate::api_ws::OutgoingEvent;
use crate::config::Config;
use crate::{publish_applied, AppState};

/// Spawns every long-running task the server needs besides the HTTP
/// listener. `updates_rx` is the settled-job side of the pipeline channel
/// created in `main`; handles are returned so shutdown can wait on them.
pub fn spawn_background_tasks(
    state: Arc<AppState>,
    config: &Config,
    updates_rx: mpsc::Receiver<CallSummary>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(tokio::spawn(seed_extensions(state.clone())));

    let (outcomes_tx, outcomes_rx) = mpsc::channel::<AppliedCall>(256);
    let reconciler = ReconcileService::new(
        state.pbx.clone(),
        state.store.clone(),
        state.pool.clone(),
        ReconcileConfig {
            interval_secs: config.sync.interval_secs,
            max_interval_secs: config.sync.max_interval_secs,
            page_size: config.sync.page_size,
            lookback_secs: config.sync.lookback_secs,
        },
        outcomes_tx,
    );
    handles.push(tokio::spawn(reconciler.run(shutdown.clone())));
    handles.push(tokio::spawn(forward_outcomes(state.clone(), outcomes_rx)));

    handles.extend(state.pipeline.start(shutdown));
    handles.push(tokio::spawn(resume_pipeline(state.clone())));
    handles.push(tokio::spawn(forward_summaries(state, updates_rx)));

    handles
}

/// Pulls the extension directory from the PBX once at startup so presence
/// starts from the full roster instead of only extensions seen in events.
/// A failure here is not fatal; extensions fill in as events arrive.
async fn seed_extensions(state: Arc<AppState>) {
    match state.pbx.extension_list().await {
        Ok(roster) => {
            let count = roster.len();
            match state.store.seed_extensions(roster).await {
                Ok(changed) => {
                    tracing::info!(total = count, changed = changed.len(), "extension roster seeded");
                    for extension in changed {
                        state
                            .hub
                            .broadcast(&OutgoingEvent::ExtensionUpdated { extension })
                            .await;
                    }
                }
                Err(e) => tracing::error!("failed to store extension roster: {e}"),
            }
        }
        Err(e) => {
            tracing::warn!("extension roster pull failed, continuing without seed: {e}");
        }
    }
}

/// Requeues pipeline jobs that were interrupted by the previous shutdown.
async fn resume_pipeline(state: Arc<AppState>) {
    match state.pipeline.resume_interrupted().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(jobs = n, "resumed interrupted pipeline jobs"),
        Err(e) => tracing::error!("failed to resume pipeline jobs: {e}"),
    }
}

/// Fans reconciliation outcomes out to subscribers and feeds terminal
/// calls with recordings into the pipeline, same as the webhook path.
async fn forward_outcomes(state: Arc<AppState>, mut outcomes: mpsc::Receiver<AppliedCall>) {
    while let Some(update) = outcomes.recv().await {
        publish_applied(&state, &update).await;
    }
}

/// Pushes settled pipeline jobs (done or failed) to subscribers.
async fn forward_summaries(state: Arc<AppState>, mut updates: mpsc::Receiver<CallSummary>) {
    while let Some(summary) = updates.recv().await {
        state
            .hub
            .broadcast(&OutgoingEvent::SummaryUpdated { summary })
            .await;
    }
}
