//! Call summary records produced by the transcription pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage of the per-call transcription pipeline.
///
/// Progression is `pending → downloading → transcribing → summarizing →
/// done`, with `failed` reachable from any non-terminal stage. The current
/// stage is persisted before the stage's work begins, so a restart resumes
/// from the first incomplete stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Downloading,
    Transcribing,
    Summarizing,
    Done,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Transcribing => "transcribing",
            Self::Summarizing => "summarizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Parses a status string. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "transcribing" => Some(Self::Transcribing),
            "summarizing" => Some(Self::Summarizing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True once the job will make no further progress on its own.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// True while a worker owns the job.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Downloading | Self::Transcribing | Self::Summarizing)
    }
}

/// Broad classification of a call assigned by the summarizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallCategory {
    Enquiry,
    Sales,
    Support,
    Complaint,
    Other,
}

impl CallCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enquiry => "enquiry",
            Self::Sales => "sales",
            Self::Support => "support",
            Self::Complaint => "complaint",
            Self::Other => "other",
        }
    }

    /// Parses a category string, mapping anything unrecognized to `Other`.
    /// The model output is untrusted; a novel label must not fail the stage.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "enquiry" | "inquiry" => Self::Enquiry,
            "sales" => Self::Sales,
            "support" => Self::Support,
            "complaint" => Self::Complaint,
            _ => Self::Other,
        }
    }
}

/// Overall sentiment of the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    /// Parses a sentiment string, defaulting to `Neutral` for anything else.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "positive" => Self::Positive,
            "negative" => Self::Negative,
            _ => Self::Neutral,
        }
    }
}

/// The structured fields extracted by the summarization stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryFields {
    pub category: CallCategory,
    pub sentiment: Sentiment,
    /// Short topic strings, most significant first.
    pub topics: Vec<String>,
    /// Follow-up actions, in the order they were committed to.
    pub action_items: Vec<String>,
}

impl SummaryFields {
    /// The fields recorded for a recording with no usable speech.
    pub fn no_speech() -> Self {
        Self {
            category: CallCategory::Other,
            sentiment: Sentiment::Neutral,
            topics: Vec::new(),
            action_items: Vec::new(),
        }
    }
}

/// One pipeline job and its eventual output, keyed 1:1 by call id.
///
/// Owned exclusively by the transcription pipeline; no other component
/// mutates these rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: String,
    /// Provider reference to the recording being processed.
    pub recording: String,
    pub status: PipelineStatus,
    /// Scratch path of the downloaded audio; survives restarts so the
    /// download stage is not repeated.
    pub audio_path: Option<String>,
    pub transcript: Option<String>,
    pub category: Option<CallCategory>,
    pub sentiment: Option<Sentiment>,
    pub topics: Vec<String>,
    pub action_items: Vec<String>,
    pub failure_reason: Option<String>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
