//! Call, extension, and contact records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CallDirection, CallStatus, ExtensionStatus};

/// A single call tracked by the state store.
///
/// One record exists per provider-assigned `call_id`. Updates are idempotent
/// merges; once a terminal status is reached the record is immutable except
/// for late attachment of a recording reference or end timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Provider-assigned call identifier, stable across the call's lifetime.
    pub call_id: String,
    /// Matched contact from the directory, display decoration only.
    pub contact_id: Option<i64>,
    pub caller_number: String,
    pub callee_number: String,
    pub caller_name: Option<String>,
    pub callee_name: Option<String>,
    pub direction: CallDirection,
    pub status: CallStatus,
    /// Extension participating in the call, when known.
    pub extension: Option<String>,
    pub trunk: Option<String>,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Total call duration in seconds, recomputed on terminal transition.
    pub duration: i64,
    /// Ring time in seconds before answer or abandon.
    pub ring_duration: i64,
    /// Provider reference to the call recording, attached when available.
    pub recording: Option<String>,
    /// Bumped on every effective merge; unchanged by stale duplicates.
    pub version: u64,
}

impl Call {
    /// Creates a fresh record for a call first observed via `call_id`.
    pub fn new(call_id: impl Into<String>, direction: CallDirection, status: CallStatus) -> Self {
        Self {
            call_id: call_id.into(),
            contact_id: None,
            caller_number: String::new(),
            callee_number: String::new(),
            caller_name: None,
            callee_name: None,
            direction,
            status,
            extension: None,
            trunk: None,
            start_time: Utc::now(),
            answer_time: None,
            end_time: None,
            duration: 0,
            ring_duration: 0,
            recording: None,
            version: 0,
        }
    }
}

/// A PBX extension (dial-plan endpoint).
///
/// Created on first observation from the PBX, never deleted; a prolonged
/// provider "unavailable" marks it offline instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    /// Dial-plan number, unique per PBX.
    pub number: String,
    pub name: Option<String>,
    pub status: ExtensionStatus,
    pub registered: bool,
    /// The call currently occupying this extension, if any.
    pub current_call_id: Option<String>,
    pub current_caller: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Extension {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            name: None,
            status: ExtensionStatus::Offline,
            registered: false,
            current_call_id: None,
            current_caller: None,
            last_seen: None,
        }
    }
}

/// A contact-directory entry used to decorate call events for display.
///
/// Contact management itself is outside this layer; only the phone-number
/// lookup is consumed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub company: Option<String>,
    pub phone: String,
}
