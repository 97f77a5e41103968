//! Transcript summarization against a local LLM server.
//!
//! Talks the Ollama generate API: one POST per transcript with
//! `format: "json"` so the model is constrained to emit a JSON object.
//! The model output is still untrusted; anything that does not satisfy the
//! contract is a retryable stage failure, and unknown category or sentiment
//! labels degrade to their lossy defaults instead of failing the job.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use switchboard_types::{CallCategory, Sentiment, SummaryFields};

use crate::error::PipelineError;

/// Abstraction over the summarization backend so the pipeline can be
/// exercised with a scripted model in tests.
pub trait Summarizer: Send + Sync + 'static {
    fn summarize(
        &self,
        transcript: &str,
    ) -> impl Future<Output = Result<SummaryFields, PipelineError>> + Send;
}

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Base URL of the model server, e.g. `http://127.0.0.1:11434`.
    pub base_url: String,
    /// Model name, e.g. `llama3.1:8b`.
    pub model: String,
    /// Per-request timeout in seconds. Summarization of a long call on CPU
    /// is slow; default generously.
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            request_timeout_secs: 300,
        }
    }
}

pub struct OllamaSummarizer {
    http: reqwest::Client,
    config: OllamaConfig,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// The JSON object the model is asked to produce. Every field defaults so
/// a terse model cannot fail the parse by omission.
#[derive(Debug, Deserialize)]
struct ModelOutput {
    #[serde(default)]
    category: String,
    #[serde(default)]
    sentiment: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    action_items: Vec<String>,
}

impl OllamaSummarizer {
    pub fn new(config: OllamaConfig) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                PipelineError::Summarization(format!("failed to build http client: {e}"))
            })?;
        Ok(Self { http, config })
    }

    async fn generate(&self, transcript: &str) -> Result<SummaryFields, PipelineError> {
        let url = format!("{}/api/generate", self.config.base_url);
        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": build_prompt(transcript),
            "stream": false,
            "format": "json",
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Summarization(format!("model server request: {e}")))?
            .error_for_status()
            .map_err(|e| PipelineError::Summarization(format!("model server status: {e}")))?;

        let generate: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::Summarization(format!("invalid generate response: {e}")))?;

        parse_model_output(&generate.response)
    }
}

impl Summarizer for OllamaSummarizer {
    fn summarize(
        &self,
        transcript: &str,
    ) -> impl Future<Output = Result<SummaryFields, PipelineError>> + Send {
        self.generate(transcript)
    }
}

fn build_prompt(transcript: &str) -> String {
    format!(
        "You are an assistant that analyzes phone call transcripts for a \
         business. Respond with a single JSON object with these keys: \
         \"category\" (one of: enquiry, sales, support, complaint, other), \
         \"sentiment\" (one of: positive, neutral, negative), \
         \"topics\" (array of short topic strings), \
         \"action_items\" (array of follow-up actions, empty if none).\n\n\
         Transcript:\n{transcript}"
    )
}

/// Parses the model's JSON payload into summary fields.
fn parse_model_output(raw: &str) -> Result<SummaryFields, PipelineError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| PipelineError::Summarization(format!("model emitted invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(PipelineError::Summarization(
            "model output is not a JSON object".to_string(),
        ));
    }
    let output: ModelOutput = serde_json::from_value(value)
        .map_err(|e| PipelineError::Summarization(format!("model output shape: {e}")))?;

    Ok(SummaryFields {
        category: CallCategory::parse_lossy(&output.category.to_lowercase()),
        sentiment: Sentiment::parse_lossy(&output.sentiment.to_lowercase()),
        topics: output.topics,
        action_items: output.action_items,
    })
}
