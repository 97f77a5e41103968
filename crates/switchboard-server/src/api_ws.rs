//! WebSocket fan-out and connection management.
//!
//! Dashboards connect once and receive every state change as it happens:
//! call updates, extension presence, and settled pipeline jobs. A client
//! may narrow its feed to a set of extensions; events match when the call
//! involves one of them on either leg. Fan-out never blocks the event
//! path: each session has a bounded queue, and a client that cannot keep
//! up is disconnected rather than buffered without limit.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use switchboard_types::{Call, CallSummary, Extension as PbxExtensionRecord};

use crate::AppState;

/// Per-session outgoing buffer. Beyond this the client is too slow and the
/// session is closed.
const SESSION_QUEUE_CAPACITY: usize = 256;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    /// Shared-secret token; same value the webhook surface requires.
    pub token: Option<String>,
    /// Optional comma-separated extension filter, e.g. `201,202`.
    pub extensions: Option<String>,
}

/// Incoming WebSocket control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    /// Replace the extension filter with the given set.
    Subscribe { extensions: Vec<String> },
    /// Clear the filter and receive everything.
    SubscribeAll,
}

/// Outgoing event frames pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingEvent {
    CallUpdated { call: Call },
    ExtensionUpdated { extension: PbxExtensionRecord },
    SummaryUpdated { summary: CallSummary },
    Error { message: String },
}

impl OutgoingEvent {
    /// The extension numbers this event concerns, used against session
    /// filters. `None` means the event is relevant to every subscriber.
    fn filter_keys(&self) -> Option<Vec<&str>> {
        match self {
            Self::CallUpdated { call } => {
                let mut keys = vec![call.caller_number.as_str(), call.callee_number.as_str()];
                if let Some(ext) = &call.extension {
                    keys.push(ext.as_str());
                }
                Some(keys)
            }
            Self::ExtensionUpdated { extension } => Some(vec![extension.number.as_str()]),
            Self::SummaryUpdated { .. } | Self::Error { .. } => None,
        }
    }
}

struct Session {
    sender: mpsc::Sender<String>,
    /// `None` means no filter: the session receives everything.
    extensions: Option<HashSet<String>>,
}

/// Tracks connected WebSocket subscribers and fans events out to them.
#[derive(Clone, Default)]
pub struct SubscriberHub {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self::default()
    }

    async fn add_session(
        &self,
        sender: mpsc::Sender<String>,
        extensions: Option<HashSet<String>>,
    ) -> Uuid {
        let session_id = Uuid::new_v4();
        self.sessions.write().await.insert(
            session_id,
            Session { sender, extensions },
        );
        session_id
    }

    async fn remove_session(&self, session_id: Uuid) {
        self.sessions.write().await.remove(&session_id);
    }

    async fn set_filter(&self, session_id: Uuid, extensions: Option<HashSet<String>>) {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.extensions = extensions;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Broadcasts one event to every matching session. A session whose
    /// queue is full is dropped; the client reconnects and resyncs via the
    /// REST surface.
    pub async fn broadcast(&self, event: &OutgoingEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize outgoing event: {e}");
                return;
            }
        };
        let keys = event.filter_keys();

        let mut to_drop = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (session_id, session) in sessions.iter() {
                if !session_matches(session, keys.as_deref()) {
                    continue;
                }
                match session.sender.try_send(json.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            session_id = %session_id,
                            "subscriber queue full, disconnecting slow consumer"
                        );
                        to_drop.push(*session_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        to_drop.push(*session_id);
                    }
                }
            }
        }

        if !to_drop.is_empty() {
            let mut sessions = self.sessions.write().await;
            for session_id in to_drop {
                sessions.remove(&session_id);
            }
        }
    }
}

fn session_matches(session: &Session, keys: Option<&[&str]>) -> bool {
    let Some(filter) = &session.extensions else {
        return true;
    };
    let Some(keys) = keys else {
        return true;
    };
    keys.iter().any(|key| filter.contains(*key))
}

fn parse_extension_filter(raw: Option<&str>) -> Option<HashSet<String>> {
    let raw = raw?;
    let set: HashSet<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

/// WebSocket handler: `GET /ws?token=...&extensions=201,202`.
///
/// The token is the same shared secret the webhook surface requires. Auth
/// failures are logged with the remote address.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
) -> impl IntoResponse {
    // An empty configured token disables this surface entirely, matching
    // the webhook endpoints; a client sending `?token=` must not slip
    // through the equality check.
    if state.api_token.is_empty() || params.token.as_deref() != Some(state.api_token.as_str()) {
        tracing::warn!(remote_addr = %addr, "websocket auth failed");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let filter = parse_extension_filter(params.extensions.as_deref());
    tracing::info!(
        remote_addr = %addr,
        filtered = filter.is_some(),
        "websocket subscriber connected"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

/// Handles the WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    filter: Option<HashSet<String>>,
) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<String>(SESSION_QUEUE_CAPACITY);
    let session_id = state.hub.add_session(tx.clone(), filter).await;

    // Forward queued events to the socket. When the hub drops the session
    // (slow consumer), the channel closes and a close frame goes out so the
    // client is actually disconnected, not just silenced.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(AxumMessage::Close(None)).await;
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                AxumMessage::Text(text) => {
                    match serde_json::from_str::<IncomingMessage>(&text) {
                        Ok(IncomingMessage::Subscribe { extensions }) => {
                            let filter = if extensions.is_empty() {
                                None
                            } else {
                                Some(extensions.into_iter().collect())
                            };
                            recv_state.hub.set_filter(session_id, filter).await;
                        }
                        Ok(IncomingMessage::SubscribeAll) => {
                            recv_state.hub.set_filter(session_id, None).await;
                        }
                        Err(_) => {
                            let error = OutgoingEvent::Error {
                                message: "invalid message format".to_string(),
                            };
                            if let Ok(json) = serde_json::to_string(&error) {
                                let _ = tx.try_send(json);
                            }
                        }
                    }
                }
                AxumMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Either half finishing tears the whole connection down.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.remove_session(session_id).await;
    tracing::debug!(session_id = %session_id, "websocket subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_types::{CallDirection, CallStatus};

    fn call_event(caller: &str, callee: &str, ext: Option<&str>) -> OutgoingEvent {
        let mut call = Call::new("c-1", CallDirection::Inbound, CallStatus::Ringing);
        call.caller_number = caller.to_string();
        call.callee_number = callee.to_string();
        call.extension = ext.map(str::to_string);
        OutgoingEvent::CallUpdated { call }
    }

    #[tokio::test]
    async fn unfiltered_session_receives_everything() {
        let hub = SubscriberHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.add_session(tx, None).await;

        hub.broadcast(&call_event("+971501234567", "201", Some("201"))).await;
        let frame = rx.recv().await.expect("frame");
        assert!(frame.contains("call_updated"));
    }

    #[tokio::test]
    async fn filter_matches_extension_or_either_party() {
        let hub = SubscriberHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.add_session(tx, Some(HashSet::from(["202".to_string()]))).await;

        // Extension leg does not match, but the callee does.
        hub.broadcast(&call_event("+971501234567", "202", Some("201"))).await;
        assert!(rx.try_recv().is_ok());

        // Nothing matches.
        hub.broadcast(&call_event("+971501234567", "203", Some("201"))).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn summary_events_bypass_the_filter() {
        let hub = SubscriberHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.add_session(tx, Some(HashSet::from(["999".to_string()]))).await;

        let event = OutgoingEvent::Error {
            message: "test".to_string(),
        };
        hub.broadcast(&event).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn slow_consumer_is_disconnected() {
        let hub = SubscriberHub::new();
        let (tx, _rx) = mpsc::channel(1);
        hub.add_session(tx, None).await;

        // First fills the queue, second overflows it.
        hub.broadcast(&call_event("100", "201", None)).await;
        hub.broadcast(&call_event("100", "201", None)).await;
        assert_eq!(hub.session_count().await, 0);
    }

    #[test]
    fn extension_filter_parsing() {
        assert!(parse_extension_filter(None).is_none());
        assert!(parse_extension_filter(Some("")).is_none());
        assert!(parse_extension_filter(Some(" , ")).is_none());
        let set = parse_extension_filter(Some("201, 202")).expect("filter");
        assert!(set.contains("201"));
        assert!(set.contains("202"));
    }
}
