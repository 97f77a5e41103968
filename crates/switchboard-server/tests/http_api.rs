//! End-to-end tests for the HTTP and WebSocket surfaces.
//!
//! These build the full router against a temporary database, with the
//! pipeline constructed but its workers not started, so webhook ingest,
//! REST reads, and fan-out can be exercised without external services.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use switchboard_pbx::{PbxClient, PbxConfig};
use switchboard_pipeline::{OllamaConfig, OllamaSummarizer, Pipeline, PipelineConfig, SttService};
use switchboard_server::api_ws::{OutgoingEvent, SubscriberHub};
use switchboard_server::{app, AppState};
use switchboard_sync::StateStore;
use switchboard_types::{Call, CallDirection, CallStatus};

const TOKEN: &str = "test-token";

struct TestCtx {
    _dir: tempfile::TempDir,
    _updates_rx: tokio::sync::mpsc::Receiver<switchboard_types::CallSummary>,
    state: Arc<AppState>,
}

impl TestCtx {
    fn router(&self) -> axum::Router {
        app(self.state.clone())
    }
}

async fn test_ctx() -> TestCtx {
    test_ctx_with_token(TOKEN).await
}

async fn test_ctx_with_token(token: &str) -> TestCtx {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("test.db");
    let pool = switchboard_db::create_pool(
        db_path.to_str().expect("utf8 path"),
        switchboard_db::DbRuntimeSettings::default(),
    )
    .expect("pool");
    {
        let conn = pool.get().expect("conn");
        switchboard_db::run_migrations(&conn).expect("migrations");
    }

    // Points at a closed port; nothing in these tests performs PBX I/O.
    let pbx = Arc::new(
        PbxClient::new(PbxConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            request_timeout_secs: 1,
        })
        .expect("pbx client"),
    );

    let store = Arc::new(StateStore::load(pool.clone()).await.expect("store"));
    let summarizer = OllamaSummarizer::new(OllamaConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        ..OllamaConfig::default()
    })
    .expect("summarizer");
    let (updates_tx, updates_rx) = tokio::sync::mpsc::channel(16);
    let pipeline = Pipeline::new(
        PipelineConfig {
            audio_dir: dir.path().join("audio"),
            ..PipelineConfig::default()
        },
        pool.clone(),
        pbx.clone(),
        SttService::new("true", "model.bin"),
        summarizer,
        updates_tx,
    );

    let state = Arc::new(AppState {
        pool,
        store,
        pbx,
        hub: SubscriberHub::new(),
        pipeline,
        api_token: token.to_string(),
        process_internal: false,
    });

    TestCtx {
        _dir: dir,
        _updates_rx: updates_rx,
        state,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

#[tokio::test]
async fn health_check_returns_ok() {
    let ctx = test_ctx().await;
    let response = ctx.router().oneshot(get("/health")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn webhook_requires_token() {
    let ctx = test_ctx().await;
    let payload = json!({"event": "Ringing", "callid": "c-1", "ext": "201"});

    let response = ctx
        .router()
        .oneshot(post_json("/webhooks/pbx", &payload))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = ctx
        .router()
        .oneshot(post_json("/webhooks/pbx?token=wrong", &payload))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn ringing_webhook_creates_live_call() {
    let ctx = test_ctx().await;
    let payload = json!({
        "event": "Ringing",
        "callid": "c-1",
        "ext": "201",
        "callerid": "+971501234567",
        "to": "201"
    });

    let response = ctx
        .router()
        .oneshot(post_json(&format!("/webhooks/pbx?token={TOKEN}"), &payload))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["applied"], 1);

    let response = ctx
        .router()
        .oneshot(get("/api/calls/c-1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let call = body_json(response).await;
    assert_eq!(call["status"], "ringing");
    assert_eq!(call["caller_number"], "+971501234567");

    let response = ctx
        .router()
        .oneshot(get("/api/calls/active"))
        .await
        .expect("response");
    let active = body_json(response).await;
    assert_eq!(active.as_array().map(Vec::len), Some(1));

    // The ringing extension shows up with live presence.
    let response = ctx
        .router()
        .oneshot(get("/api/extensions"))
        .await
        .expect("response");
    let extensions = body_json(response).await;
    assert_eq!(extensions[0]["number"], "201");
    assert_eq!(extensions[0]["status"], "ringing");
}

#[tokio::test]
async fn token_is_accepted_via_header() {
    let ctx = test_ctx().await;
    let payload = json!({"event": "Ringing", "callid": "c-1", "ext": "201"});
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/pbx")
        .header("content-type", "application/json")
        .header("x-webhook-token", TOKEN)
        .body(Body::from(payload.to_string()))
        .expect("request");

    let response = ctx.router().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn cdr_webhook_settles_call_and_queues_pipeline_job() {
    let ctx = test_ctx().await;
    let payload = json!({
        "callid": "c-2",
        "disposition": "ANSWERED",
        "src": "+971501234567",
        "dst": "202",
        "ext": "202",
        "start": "2026-08-30 10:00:00",
        "answer": "2026-08-30 10:00:05",
        "end": "2026-08-30 10:02:10",
        "duration": 125,
        "ringtime": 5,
        "recording": "rec-2.wav"
    });

    let response = ctx
        .router()
        .oneshot(post_json(
            &format!("/webhooks/pbx/cdr?token={TOKEN}"),
            &payload,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = ctx
        .router()
        .oneshot(get("/api/calls/c-2"))
        .await
        .expect("response");
    let call = body_json(response).await;
    assert_eq!(call["status"], "ended");
    assert_eq!(call["duration"], 125);

    // The terminal call with a recording produced a pending pipeline job.
    let response = ctx
        .router()
        .oneshot(get("/api/summaries/c-2"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let summary = body_json(response).await;
    assert_eq!(summary["status"], "pending");
    assert_eq!(summary["recording"], "rec-2.wav");

    let response = ctx
        .router()
        .oneshot(get("/api/pipeline/status"))
        .await
        .expect("response");
    let status = body_json(response).await;
    assert_eq!(status["jobs"]["pending"], 1);
}

#[tokio::test]
async fn internal_calls_do_not_enter_the_pipeline() {
    let ctx = test_ctx().await;
    let payload = json!({
        "callid": "c-int",
        "internal": "yes",
        "disposition": "ANSWERED",
        "src": "201",
        "dst": "202",
        "start": "2026-08-30 11:00:00",
        "end": "2026-08-30 11:00:30",
        "recording": "rec-int.wav"
    });

    let response = ctx
        .router()
        .oneshot(post_json(
            &format!("/webhooks/pbx/cdr?token={TOKEN}"),
            &payload,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // The call itself is recorded, but no summary job was created.
    let response = ctx
        .router()
        .oneshot(get("/api/calls/c-int"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = ctx
        .router()
        .oneshot(get("/api/summaries/c-int"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn hangup_for_unknown_call_is_stale() {
    let ctx = test_ctx().await;
    let payload = json!({"event": "Hangup", "callid": "c-ghost", "ext": "201"});

    let response = ctx
        .router()
        .oneshot(post_json(&format!("/webhooks/pbx?token={TOKEN}"), &payload))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["applied"], 0);
    assert_eq!(body["stale"], 1);

    let response = ctx
        .router()
        .oneshot(get("/api/calls/c-ghost"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_webhook_is_acknowledged_not_retried() {
    let ctx = test_ctx().await;
    let payload = json!({"event": "SomethingNew", "callid": "c-3"});

    let response = ctx
        .router()
        .oneshot(post_json(&format!("/webhooks/pbx?token={TOKEN}"), &payload))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ignored");
}

#[tokio::test]
async fn unknown_call_and_summary_return_404() {
    let ctx = test_ctx().await;

    let response = ctx
        .router()
        .oneshot(get("/api/calls/nope"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = ctx
        .router()
        .oneshot(get("/api/summaries/nope"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_endpoint_requeues_only_failed_jobs() {
    let ctx = test_ctx().await;
    {
        let conn = ctx.state.pool.get().expect("conn");
        switchboard_db::create_pending_summary(&conn, "c-9", "rec-9.wav").expect("create");
        switchboard_db::fail_summary(&conn, "c-9", "stt exploded").expect("fail");
    }

    let response = ctx
        .router()
        .oneshot(post_json("/api/summaries/c-9/retry", &json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = ctx
        .router()
        .oneshot(get("/api/summaries/c-9"))
        .await
        .expect("response");
    let summary = body_json(response).await;
    assert_eq!(summary["status"], "pending");
    assert_eq!(summary["attempts"], 0);

    // Not failed anymore: a second retry conflicts.
    let response = ctx
        .router()
        .oneshot(post_json("/api/summaries/c-9/retry", &json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = ctx
        .router()
        .oneshot(post_json("/api/summaries/missing/retry", &json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_endpoints_are_bounded() {
    let ctx = test_ctx().await;
    {
        let conn = ctx.state.pool.get().expect("conn");
        for i in 0..5 {
            let mut call = Call::new(format!("c-{i}"), CallDirection::Inbound, CallStatus::Ended);
            call.caller_number = "+971501234567".to_string();
            call.callee_number = "201".to_string();
            switchboard_db::upsert_call(&conn, &call).expect("upsert");
        }
    }

    let response = ctx
        .router()
        .oneshot(get("/api/calls?limit=2"))
        .await
        .expect("response");
    let calls = body_json(response).await;
    assert_eq!(calls.as_array().map(Vec::len), Some(2));

    let response = ctx
        .router()
        .oneshot(get("/api/calls"))
        .await
        .expect("response");
    let calls = body_json(response).await;
    assert_eq!(calls.as_array().map(Vec::len), Some(5));
}

async fn serve(ctx: &TestCtx) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = ctx
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn wait_for_session(hub: &SubscriberHub) {
    for _ in 0..100 {
        if hub.session_count().await > 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("websocket session never registered");
}

#[tokio::test]
async fn websocket_rejects_bad_token() {
    let ctx = test_ctx().await;
    let addr = serve(&ctx).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=wrong")).await;
    assert!(result.is_err(), "handshake must fail without the token");
}

#[tokio::test]
async fn websocket_is_disabled_when_no_token_is_configured() {
    let ctx = test_ctx_with_token("").await;
    let addr = serve(&ctx).await;

    // `?token=` must not satisfy an empty configured token.
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=")).await;
    assert!(result.is_err(), "disabled surface must reject the handshake");

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn overflowed_subscriber_gets_a_close_frame() {
    let ctx = test_ctx().await;
    let addr = serve(&ctx).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={TOKEN}"))
            .await
            .expect("connect");
    wait_for_session(&ctx.state.hub).await;

    // Flood without reading: large frames fill the socket buffers, then
    // the session queue, and the hub drops the session.
    let message = "x".repeat(64 * 1024);
    for _ in 0..600 {
        ctx.state
            .hub
            .broadcast(&OutgoingEvent::Error {
                message: message.clone(),
            })
            .await;
        if ctx.state.hub.session_count().await == 0 {
            break;
        }
    }
    assert_eq!(ctx.state.hub.session_count().await, 0);

    // Draining the backlog ends with an explicit close from the server,
    // not a connection that idles until the client gives up.
    let saw_close = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while let Some(Ok(frame)) = socket.next().await {
            if frame.is_close() {
                return true;
            }
        }
        false
    })
    .await
    .expect("connection should settle in time");
    assert!(saw_close, "overflowed subscriber should be closed");
}

#[tokio::test]
async fn websocket_receives_broadcast_frames() {
    let ctx = test_ctx().await;
    let addr = serve(&ctx).await;

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={TOKEN}"))
            .await
            .expect("connect");
    wait_for_session(&ctx.state.hub).await;

    let mut call = Call::new("c-ws", CallDirection::Inbound, CallStatus::Ringing);
    call.caller_number = "+971501234567".to_string();
    call.callee_number = "201".to_string();
    ctx.state
        .hub
        .broadcast(&OutgoingEvent::CallUpdated { call })
        .await;

    let frame = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .expect("frame");
    let value: Value = serde_json::from_str(frame.to_text().expect("text frame")).expect("json");
    assert_eq!(value["type"], "call_updated");
    assert_eq!(value["call"]["call_id"], "c-ws");
}

#[tokio::test]
async fn websocket_extension_filter_applies() {
    let ctx = test_ctx().await;
    let addr = serve(&ctx).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/ws?token={TOKEN}&extensions=205"
    ))
    .await
    .expect("connect");
    wait_for_session(&ctx.state.hub).await;

    let mut other = Call::new("c-a", CallDirection::Inbound, CallStatus::Ringing);
    other.callee_number = "201".to_string();
    ctx.state
        .hub
        .broadcast(&OutgoingEvent::CallUpdated { call: other })
        .await;

    let mut mine = Call::new("c-b", CallDirection::Inbound, CallStatus::Ringing);
    mine.callee_number = "205".to_string();
    ctx.state
        .hub
        .broadcast(&OutgoingEvent::CallUpdated { call: mine })
        .await;

    // Only the matching call arrives.
    let frame = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .expect("frame");
    let value: Value = serde_json::from_str(frame.to_text().expect("text frame")).expect("json");
    assert_eq!(value["call"]["call_id"], "c-b");
}
