//! Canonical events produced by the normalizer.
//!
//! Raw provider payloads — webhook pushes and reconciliation pull diffs —
//! are heterogeneous and untrusted. The normalizer reduces them to the two
//! shapes below before anything touches the state store, so the webhook and
//! poll paths cannot diverge in behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CallDirection, CallStatus, ExtensionStatus};

/// Where a raw payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Live call-progress webhook push.
    WebhookCall,
    /// CDR webhook push (call completed).
    WebhookCdr,
    /// Record pulled by the reconciliation loop.
    PollDiff,
}

impl EventOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebhookCall => "webhook_call",
            Self::WebhookCdr => "webhook_cdr",
            Self::PollDiff => "poll_diff",
        }
    }
}

/// What class of call event this is.
///
/// `Cdr` is distinct from the live-progress kinds because a CDR is allowed
/// to create a call record even at a terminal status — that is how the
/// reconciliation loop backfills calls whose webhooks were never delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ringing,
    Answered,
    Hangup,
    Cdr,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Hangup => "hangup",
            Self::Cdr => "cdr",
        }
    }
}

/// A normalized call event. Every field except `call_id`, `kind`, `status`,
/// and `origin` is optional: events merge into the stored record rather than
/// replacing it, so partial payloads are fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub call_id: String,
    pub kind: EventKind,
    pub status: CallStatus,
    pub origin: EventOrigin,
    pub direction: Option<CallDirection>,
    pub extension: Option<String>,
    pub caller_number: Option<String>,
    pub callee_number: Option<String>,
    pub caller_name: Option<String>,
    pub callee_name: Option<String>,
    pub trunk: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub ring_duration: Option<i64>,
    pub recording: Option<String>,
}

impl CallEvent {
    /// A minimal event carrying only the identifying fields; used as the
    /// starting point by the normalizer and by tests.
    pub fn bare(
        call_id: impl Into<String>,
        kind: EventKind,
        status: CallStatus,
        origin: EventOrigin,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            kind,
            status,
            origin,
            direction: None,
            extension: None,
            caller_number: None,
            callee_number: None,
            caller_name: None,
            callee_name: None,
            trunk: None,
            start_time: None,
            answer_time: None,
            end_time: None,
            duration: None,
            ring_duration: None,
            recording: None,
        }
    }
}

/// A normalized extension-presence event (provider `ALERT`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionEvent {
    pub extension: String,
    pub status: ExtensionStatus,
    pub registered: bool,
    pub origin: EventOrigin,
}

/// Output of the normalizer: one raw payload can yield zero or more of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    Call(CallEvent),
    Extension(ExtensionEvent),
}
