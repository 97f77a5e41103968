//! Speech-to-text via a local whisper.cpp-style subprocess.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::error::PipelineError;
use crate::runner::Transcriber;

/// Maximum audio input size (50 MiB). A call recording larger than this is
/// almost certainly not a call recording.
const MAX_AUDIO_BYTES: u64 = 50 * 1024 * 1024;

/// Timeout for one transcription run.
const STT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SttService {
    binary_path: PathBuf,
    model_path: PathBuf,
    /// Forced language hint, e.g. `"en"`; autodetect when `None`.
    language: Option<String>,
}

impl SttService {
    pub fn new(binary_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            model_path: model_path.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Transcribes the audio file at `path`. Returns the plain transcript;
    /// an empty string means the model found no usable speech.
    pub async fn transcribe_file(&self, path: &Path) -> Result<String, PipelineError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > MAX_AUDIO_BYTES {
            return Err(PipelineError::Transcription(format!(
                "audio file exceeds maximum size: {size} bytes (limit: {MAX_AUDIO_BYTES})"
            )));
        }

        let mut command = Command::new(&self.binary_path);
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(path)
            .arg("--no-timestamps")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(language) = &self.language {
            command.arg("-l").arg(language);
        }

        let child = command
            .spawn()
            .map_err(|e| PipelineError::Transcription(format!("failed to spawn stt binary: {e}")))?;

        let output = tokio::time::timeout(STT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                PipelineError::Transcription(format!(
                    "stt process timed out after {} seconds",
                    STT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| PipelineError::Transcription(format!("failed to collect output: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Transcription(format!(
                "stt binary exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Transcriber for SttService {
    fn transcribe(
        &self,
        audio_path: &Path,
    ) -> impl std::future::Future<Output = Result<String, PipelineError>> + Send {
        self.transcribe_file(audio_path)
    }
}
