//! HTTP client for the hosted PBX's OpenAPI.
//!
//! Covers the three pull surfaces the synchronization layer needs:
//! extension status, date-ranged CDR search, and recording download.
//! Authentication is token-based with refresh; a request that comes back
//! with a token-expired error re-authenticates and retries exactly once.

mod client;
mod error;

pub use client::{CdrPage, PbxClient, PbxConfig, PbxExtension};
pub use error::PbxError;
