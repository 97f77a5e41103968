//! Post-call processing: recording download, transcription, summarization.
//!
//! Jobs enter through [`Pipeline::enqueue`] when a call reaches a terminal
//! status with a recording attached, and through [`Pipeline::resume_interrupted`]
//! at startup. Each stage persists its marker and artifacts before moving
//! on, so the pipeline survives restarts without losing or repeating work.

mod error;
mod runner;
mod stt;
mod summarize;

pub use error::PipelineError;
pub use runner::{Pipeline, PipelineConfig, RecordingSource, Transcriber, NO_SPEECH_TRANSCRIPT};
pub use stt::SttService;
pub use summarize::{OllamaConfig, OllamaSummarizer, Summarizer};
