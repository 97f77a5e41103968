//! Switchboard server binary.
//!
//! Starts the axum HTTP/WebSocket server with structured logging, database
//! initialization, the CDR reconciliation loop, the post-call pipeline
//! workers, and graceful shutdown on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use switchboard_pbx::{PbxClient, PbxConfig};
use switchboard_pipeline::{OllamaConfig, OllamaSummarizer, Pipeline, PipelineConfig, SttService};
use switchboard_sync::StateStore;

use switchboard_server::{app, background, config, AppState};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("SWITCHBOARD_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    if config.pbx.webhook_token.is_empty() {
        tracing::warn!("pbx.webhook_token is empty; webhook and websocket surfaces are disabled");
    }

    // Initialize database
    let pool = switchboard_db::create_pool(
        &config.database.path,
        switchboard_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied =
            switchboard_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // PBX client, shared by reconciliation and recording downloads.
    let pbx = Arc::new(
        PbxClient::new(PbxConfig {
            base_url: config.pbx.base_url.clone(),
            client_id: config.pbx.client_id.clone(),
            client_secret: config.pbx.client_secret.clone(),
            request_timeout_secs: config.pbx.request_timeout_secs,
        })
        .expect("failed to build PBX client"),
    );

    // Warm the state store from persisted open calls and extensions.
    let store = Arc::new(
        StateStore::load(pool.clone())
            .await
            .expect("failed to load state store from database"),
    );

    // Post-call pipeline: download, transcribe, summarize.
    let mut transcriber = SttService::new(&config.stt.binary_path, &config.stt.model_path);
    if !config.stt.language.is_empty() {
        transcriber = transcriber.with_language(&config.stt.language);
    }
    let summarizer = OllamaSummarizer::new(OllamaConfig {
        base_url: config.summarizer.base_url.clone(),
        model: config.summarizer.model.clone(),
        request_timeout_secs: config.summarizer.request_timeout_secs,
    })
    .expect("failed to build summarizer client");

    let (updates_tx, updates_rx) = mpsc::channel(256);
    let pipeline = Pipeline::new(
        PipelineConfig {
            workers: config.pipeline.workers,
            max_attempts: config.pipeline.max_attempts,
            retry_base_secs: config.pipeline.retry_base_secs,
            queue_capacity: config.pipeline.queue_capacity,
            audio_dir: config.pipeline.audio_dir.clone().into(),
        },
        pool.clone(),
        pbx.clone(),
        transcriber,
        summarizer,
        updates_tx,
    );

    let state = Arc::new(AppState {
        pool,
        store,
        pbx,
        hub: switchboard_server::api_ws::SubscriberHub::new(),
        pipeline,
        api_token: config.pbx.webhook_token.clone(),
        process_internal: config.pipeline.process_internal_calls,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles =
        background::spawn_background_tasks(state.clone(), &config, updates_rx, shutdown_rx);

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting switchboard server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    // Signal background loops and give them a bounded window to park
    // in-flight pipeline work.
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(10), handle).await;
    }

    tracing::info!("switchboard server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
