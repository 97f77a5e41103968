//! Error taxonomy for PBX API calls.

use thiserror::Error;

/// Errors surfaced by the PBX client.
///
/// `Unavailable` is the retryable class: the reconciliation loop backs off
/// and re-polls on it, and the pipeline download stage counts it against
/// its bounded attempts. `NotFound` is terminal for the item that asked.
#[derive(Debug, Error)]
pub enum PbxError {
    /// The provider is unreachable or answering with transient failures
    /// (timeouts, connection errors, 5xx).
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Authentication failed and re-authentication did not help.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The requested record or recording does not exist on the provider.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider answered with a body the client cannot interpret,
    /// or a non-transient API error code.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for PbxError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Self::Unavailable(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() {
                return Self::Unavailable(err.to_string());
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Self::NotFound(err.to_string());
            }
        }
        Self::Protocol(err.to_string())
    }
}

impl PbxError {
    /// True when a later retry with backoff could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
