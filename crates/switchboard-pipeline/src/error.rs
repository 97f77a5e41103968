//! Error type for the post-call pipeline.

use thiserror::Error;

use switchboard_db::DbError;
use switchboard_pbx::PbxError;

/// Errors surfaced by pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The recording could not be fetched from the provider.
    #[error("recording download failed: {0}")]
    Download(#[from] PbxError),

    /// The transcription subprocess failed or produced garbage.
    #[error("transcription failed: {0}")]
    Transcription(String),

    /// The summarization model was unreachable or its output did not
    /// satisfy the JSON contract.
    #[error("summarization failed: {0}")]
    Summarization(String),

    /// Scratch-file I/O failed.
    #[error("audio io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    /// A blocking persistence task panicked or was cancelled.
    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// True when the failed attempt should be retried with backoff.
    ///
    /// Stage failures are generally transient (model restarts, provider
    /// hiccups, full disks being cleaned); a recording that does not exist
    /// and database failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Download(e) => e.is_retryable(),
            Self::Transcription(_) | Self::Summarization(_) | Self::Io(_) => true,
            Self::Db(_) | Self::Task(_) => false,
        }
    }
}
