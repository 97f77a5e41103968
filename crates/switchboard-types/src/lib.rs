//! Shared domain types for the Switchboard platform.
//!
//! This crate defines the call, extension, and summary records that every
//! other Switchboard crate operates on, together with the canonical event
//! shape produced by the normalizer. No crate in the workspace depends on
//! anything *except* `switchboard-types` for cross-cutting type definitions,
//! which keeps the dependency graph acyclic.

pub mod call;
pub mod event;
pub mod summary;

pub use call::{Call, Contact, Extension};
pub use event::{CallEvent, EventKind, EventOrigin, ExtensionEvent, NormalizedEvent};
pub use summary::{CallCategory, CallSummary, PipelineStatus, Sentiment, SummaryFields};

use serde::{Deserialize, Serialize};

/// Direction of a call relative to the PBX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    /// External party calling in to an extension.
    Inbound,
    /// An extension dialling an external number.
    Outbound,
    /// Extension-to-extension.
    Internal,
}

impl CallDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Internal => "internal",
        }
    }

    /// Parses a direction string. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

/// Lifecycle status of a call.
///
/// Statuses carry an ordinal rank used to resolve out-of-order delivery
/// between the webhook and reconciliation paths: an incoming event whose
/// rank is less than or equal to the stored rank is a stale duplicate.
/// The terminal variants share a rank and are mutually exclusive — the
/// first one observed wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Answered,
    OnHold,
    Missed,
    Busy,
    Failed,
    NoAnswer,
    Ended,
}

impl CallStatus {
    /// Ordinal rank for the stale-event rule.
    pub fn rank(self) -> u8 {
        match self {
            Self::Ringing => 1,
            Self::Answered => 2,
            Self::OnHold => 3,
            Self::Missed | Self::Busy | Self::Failed | Self::NoAnswer | Self::Ended => 4,
        }
    }

    /// True for statuses from which no further transition is expected.
    pub fn is_terminal(self) -> bool {
        self.rank() == 4
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::OnHold => "on_hold",
            Self::Missed => "missed",
            Self::Busy => "busy",
            Self::Failed => "failed",
            Self::NoAnswer => "no_answer",
            Self::Ended => "ended",
        }
    }

    /// Parses a status string. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(Self::Ringing),
            "answered" => Some(Self::Answered),
            "on_hold" => Some(Self::OnHold),
            "missed" => Some(Self::Missed),
            "busy" => Some(Self::Busy),
            "failed" => Some(Self::Failed),
            "no_answer" => Some(Self::NoAnswer),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// Presence status of an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    Available,
    Ringing,
    OnCall,
    Busy,
    Dnd,
    Offline,
}

impl ExtensionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Ringing => "ringing",
            Self::OnCall => "on_call",
            Self::Busy => "busy",
            Self::Dnd => "dnd",
            Self::Offline => "offline",
        }
    }

    /// Parses a status string. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "ringing" => Some(Self::Ringing),
            "on_call" => Some(Self::OnCall),
            "busy" => Some(Self::Busy),
            "dnd" => Some(Self::Dnd),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}
