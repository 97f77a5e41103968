//! The post-call processing pipeline.
//!
//! One job per finished call with a recording: download the audio,
//! transcribe it, summarize the transcript, persist everything. Stage
//! markers and artifacts are written to the database as soon as they exist,
//! so a job interrupted by a restart resumes at its first incomplete stage
//! instead of repeating work. Jobs are keyed 1:1 by call id; enqueueing is
//! idempotent at the database level.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use switchboard_db::{self as db, DbError, DbPool};
use switchboard_pbx::{PbxClient, PbxError};
use switchboard_types::{CallSummary, PipelineStatus, SummaryFields};

use crate::error::PipelineError;
use crate::summarize::Summarizer;

/// Transcript recorded for silent or speech-free audio; such jobs complete
/// without a summarization call.
pub const NO_SPEECH_TRANSCRIPT: &str = "no speech detected";

/// Abstraction over recording retrieval.
pub trait RecordingSource: Send + Sync + 'static {
    fn download(
        &self,
        reference: &str,
    ) -> impl Future<Output = Result<Vec<u8>, PbxError>> + Send;
}

impl RecordingSource for PbxClient {
    fn download(
        &self,
        reference: &str,
    ) -> impl Future<Output = Result<Vec<u8>, PbxError>> + Send {
        self.download_recording(reference)
    }
}

impl<R: RecordingSource> RecordingSource for Arc<R> {
    fn download(
        &self,
        reference: &str,
    ) -> impl Future<Output = Result<Vec<u8>, PbxError>> + Send {
        (**self).download(reference)
    }
}

/// Abstraction over the transcription backend.
pub trait Transcriber: Send + Sync + 'static {
    fn transcribe(
        &self,
        audio_path: &Path,
    ) -> impl Future<Output = Result<String, PipelineError>> + Send;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Concurrent pipeline workers.
    pub workers: usize,
    /// Attempts per job before it is marked failed.
    pub max_attempts: u32,
    /// Base retry delay; doubles per attempt.
    pub retry_base_secs: u64,
    /// Bound of the in-process job queue.
    pub queue_capacity: usize,
    /// Scratch directory for downloaded audio.
    pub audio_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            retry_base_secs: 5,
            queue_capacity: 256,
            audio_dir: PathBuf::from("/var/tmp/switchboard-audio"),
        }
    }
}

struct PipelineInner<R, T, S> {
    config: PipelineConfig,
    pool: DbPool,
    recordings: R,
    transcriber: T,
    summarizer: S,
    /// Call ids currently owned by a worker; a queued duplicate is dropped.
    in_flight: Mutex<HashSet<String>>,
    queue: mpsc::Sender<String>,
    /// Job updates — stage transitions and settled jobs — are forwarded
    /// here for fan-out.
    updates: mpsc::Sender<CallSummary>,
}

/// Handle to the pipeline. Clones share one queue and one worker pool.
pub struct Pipeline<R, T, S> {
    inner: Arc<PipelineInner<R, T, S>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
}

impl<R, T, S> Clone for Pipeline<R, T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            receiver: Arc::clone(&self.receiver),
        }
    }
}

impl<R, T, S> Pipeline<R, T, S>
where
    R: RecordingSource,
    T: Transcriber,
    S: Summarizer,
{
    pub fn new(
        config: PipelineConfig,
        pool: DbPool,
        recordings: R,
        transcriber: T,
        summarizer: S,
        updates: mpsc::Sender<CallSummary>,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(config.queue_capacity);
        Self {
            inner: Arc::new(PipelineInner {
                config,
                pool,
                recordings,
                transcriber,
                summarizer,
                in_flight: Mutex::new(HashSet::new()),
                queue,
                updates,
            }),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    /// Spawns the worker pool. Workers drain the queue until `shutdown`
    /// flips to true; a job in progress parks at its persisted stage.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.workers.max(1))
            .map(|worker| {
                let pipeline = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    pipeline.worker_loop(worker, shutdown).await;
                })
            })
            .collect()
    }

    /// Creates and queues a job for `call_id`, unless one already exists in
    /// any state. Returns whether a new job was created.
    pub async fn enqueue(&self, call_id: &str, recording: &str) -> Result<bool, PipelineError> {
        let pool = self.inner.pool.clone();
        let id = call_id.to_string();
        let rec = recording.to_string();
        let created = run_blocking(move || {
            let conn = pool.get()?;
            db::create_pending_summary(&conn, &id, &rec)
        })
        .await?;

        if created {
            self.push(call_id).await;
        } else {
            tracing::debug!(call_id, "job already exists, not enqueueing");
        }
        Ok(created)
    }

    /// Re-queues an existing unsettled job (startup resume, manual retry
    /// after a reset). Settled and unknown jobs are left alone.
    pub async fn requeue(&self, call_id: &str) -> Result<bool, PipelineError> {
        let pool = self.inner.pool.clone();
        let id = call_id.to_string();
        let job = run_blocking(move || {
            let conn = pool.get()?;
            db::get_summary(&conn, &id)
        })
        .await?;

        match job {
            Some(job) if !job.status.is_settled() => {
                self.push(call_id).await;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Loads every job interrupted by the previous shutdown and queues it.
    /// Called once at startup, before the webhook surface opens.
    pub async fn resume_interrupted(&self) -> Result<usize, PipelineError> {
        let pool = self.inner.pool.clone();
        let jobs = run_blocking(move || {
            let conn = pool.get()?;
            db::load_resumable_summaries(&conn)
        })
        .await?;

        let count = jobs.len();
        for job in jobs {
            tracing::info!(
                call_id = %job.call_id,
                stage = job.status.as_str(),
                "resuming interrupted job"
            );
            self.push(&job.call_id).await;
        }
        Ok(count)
    }

    async fn push(&self, call_id: &str) {
        if self.inner.queue.send(call_id.to_string()).await.is_err() {
            // Workers are gone; the pending row will be resumed next start.
            tracing::warn!(call_id, "pipeline queue closed, job left pending");
        }
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(worker, "pipeline worker started");
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    next = receiver.recv() => next,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
            };
            let Some(call_id) = next else { break };

            if !self.claim(&call_id) {
                tracing::debug!(call_id, "job already claimed by another worker");
                continue;
            }
            if let Err(e) = self.process(&call_id, &shutdown).await {
                tracing::error!(call_id, "pipeline job aborted: {e}");
            }
            self.release(&call_id);
        }
        tracing::debug!(worker, "pipeline worker stopped");
    }

    fn claim(&self, call_id: &str) -> bool {
        lock_in_flight(&self.inner.in_flight).insert(call_id.to_string())
    }

    fn release(&self, call_id: &str) {
        lock_in_flight(&self.inner.in_flight).remove(call_id);
    }

    /// Drives one job to a settled state, retrying with exponential backoff
    /// on transient failures.
    async fn process(
        &self,
        call_id: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        loop {
            let Some(job) = self.load_job(call_id).await? else {
                tracing::warn!(call_id, "queued job has no row, dropping");
                return Ok(());
            };
            if job.status.is_settled() {
                return Ok(());
            }

            match self.run_attempt(&job, shutdown).await {
                Ok(Attempt::Completed) => {
                    self.forward_update(call_id).await?;
                    return Ok(());
                }
                Ok(Attempt::Interrupted) => {
                    tracing::info!(call_id, "job parked for shutdown, will resume");
                    return Ok(());
                }
                Err(e) => {
                    let attempts = job.attempts + 1;
                    if !e.is_retryable() || attempts >= self.inner.config.max_attempts {
                        tracing::warn!(call_id, attempts, "job failed permanently: {e}");
                        self.mark_failed(call_id, &e.to_string()).await?;
                        self.forward_update(call_id).await?;
                        return Ok(());
                    }
                    let delay = self.backoff(attempts);
                    tracing::warn!(
                        call_id,
                        attempts,
                        retry_in_secs = delay.as_secs(),
                        "attempt failed, retrying: {e}"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// One attempt at the remaining stages, resuming from persisted
    /// artifacts: an existing audio file skips the download, an existing
    /// transcript skips transcription.
    async fn run_attempt(
        &self,
        job: &CallSummary,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Attempt, PipelineError> {
        let call_id = &job.call_id;

        let first_stage = if job.audio_path.is_none() {
            PipelineStatus::Downloading
        } else if job.transcript.is_none() {
            PipelineStatus::Transcribing
        } else {
            PipelineStatus::Summarizing
        };
        self.set_stage(call_id, first_stage, true).await?;

        // Download and transcribe; both are skipped when the transcript
        // artifact already exists.
        let transcript = match &job.transcript {
            Some(t) => t.clone(),
            None => {
                let audio_path = match existing_audio(job).await {
                    Some(path) => path,
                    None => {
                        if *shutdown.borrow() {
                            return Ok(Attempt::Interrupted);
                        }
                        let bytes = self.inner.recordings.download(&job.recording).await?;
                        tokio::fs::create_dir_all(&self.inner.config.audio_dir).await?;
                        let path = self
                            .inner
                            .config
                            .audio_dir
                            .join(format!("{}.wav", scratch_name(call_id)));
                        tokio::fs::write(&path, &bytes).await?;
                        let recorded = path.to_string_lossy().to_string();
                        tracing::debug!(call_id = %call_id, bytes = bytes.len(), path = %recorded, "audio downloaded");
                        self.record_audio(call_id, recorded).await?;
                        path
                    }
                };

                if *shutdown.borrow() {
                    return Ok(Attempt::Interrupted);
                }
                self.set_stage(call_id, PipelineStatus::Transcribing, false)
                    .await?;
                let text = self.inner.transcriber.transcribe(&audio_path).await?;
                let text = if text.trim().is_empty() {
                    NO_SPEECH_TRANSCRIPT.to_string()
                } else {
                    text
                };
                self.record_transcript(call_id, text.clone()).await?;
                text
            }
        };

        // A silent recording short-circuits summarization.
        if transcript == NO_SPEECH_TRANSCRIPT || transcript.trim().is_empty() {
            tracing::info!(call_id = %call_id, "no speech detected, completing without summary");
            self.complete(call_id, SummaryFields::no_speech()).await?;
            return Ok(Attempt::Completed);
        }

        // Summarize.
        if *shutdown.borrow() {
            return Ok(Attempt::Interrupted);
        }
        self.set_stage(call_id, PipelineStatus::Summarizing, false)
            .await?;
        let fields = self.inner.summarizer.summarize(&transcript).await?;
        self.complete(call_id, fields).await?;
        Ok(Attempt::Completed)
    }

    fn backoff(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(8);
        Duration::from_secs(self.inner.config.retry_base_secs * 2u64.pow(exp))
    }

    /// Forwards the job's current row on the updates channel, so observers
    /// see stage progress as well as settled outcomes.
    async fn forward_update(&self, call_id: &str) -> Result<(), PipelineError> {
        if let Some(job) = self.load_job(call_id).await? {
            if self.inner.updates.send(job).await.is_err() {
                tracing::debug!(call_id, "update receiver closed, not forwarding");
            }
        }
        Ok(())
    }

    async fn load_job(&self, call_id: &str) -> Result<Option<CallSummary>, PipelineError> {
        let pool = self.inner.pool.clone();
        let id = call_id.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            db::get_summary(&conn, &id)
        })
        .await
    }

    async fn set_stage(
        &self,
        call_id: &str,
        stage: PipelineStatus,
        new_attempt: bool,
    ) -> Result<(), PipelineError> {
        let pool = self.inner.pool.clone();
        let id = call_id.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            db::set_summary_stage(&conn, &id, stage, new_attempt)
        })
        .await?;
        self.forward_update(call_id).await
    }

    async fn record_audio(&self, call_id: &str, path: String) -> Result<(), PipelineError> {
        let pool = self.inner.pool.clone();
        let id = call_id.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            db::record_audio_path(&conn, &id, &path)
        })
        .await
    }

    async fn record_transcript(
        &self,
        call_id: &str,
        transcript: String,
    ) -> Result<(), PipelineError> {
        let pool = self.inner.pool.clone();
        let id = call_id.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            db::record_transcript(&conn, &id, &transcript)
        })
        .await
    }

    async fn complete(&self, call_id: &str, fields: SummaryFields) -> Result<(), PipelineError> {
        let pool = self.inner.pool.clone();
        let id = call_id.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            db::complete_summary(&conn, &id, &fields)
        })
        .await
    }

    async fn mark_failed(&self, call_id: &str, reason: &str) -> Result<(), PipelineError> {
        let pool = self.inner.pool.clone();
        let id = call_id.to_string();
        let reason = reason.to_string();
        run_blocking(move || {
            let conn = pool.get()?;
            db::fail_summary(&conn, &id, &reason)
        })
        .await
    }
}

enum Attempt {
    Completed,
    /// Shutdown was requested between stages; the job stays at its
    /// persisted stage and resumes on the next start.
    Interrupted,
}

/// The persisted audio path is only trusted while the file still exists;
/// scratch directories get cleaned.
async fn existing_audio(job: &CallSummary) -> Option<PathBuf> {
    let path = PathBuf::from(job.audio_path.as_ref()?);
    match tokio::fs::try_exists(&path).await {
        Ok(true) => Some(path),
        _ => None,
    }
}

/// Call ids come from the provider; keep scratch file names boring.
fn scratch_name(call_id: &str) -> String {
    call_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn lock_in_flight(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DbError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
        .map_err(PipelineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use switchboard_types::{CallCategory, Sentiment};

    struct FakeRecordings {
        downloads: AtomicU32,
        result: fn() -> Result<Vec<u8>, PbxError>,
    }

    impl RecordingSource for &'static FakeRecordings {
        async fn download(&self, _reference: &str) -> Result<Vec<u8>, PbxError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    struct FakeTranscriber {
        transcript: &'static str,
    }

    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, _audio_path: &Path) -> Result<String, PipelineError> {
            Ok(self.transcript.to_string())
        }
    }

    /// Fails the first `fail_first` calls, then succeeds.
    struct FlakySummarizer {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl Summarizer for &'static FlakySummarizer {
        async fn summarize(&self, _transcript: &str) -> Result<SummaryFields, PipelineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(PipelineError::Summarization("model emitted prose".into()))
            } else {
                Ok(SummaryFields {
                    category: CallCategory::Support,
                    sentiment: Sentiment::Negative,
                    topics: vec!["billing".to_string()],
                    action_items: vec!["call back".to_string()],
                })
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: DbPool,
        _shutdown_tx: watch::Sender<bool>,
        shutdown: watch::Receiver<bool>,
        updates: mpsc::Receiver<CallSummary>,
        updates_tx_for_new: Option<mpsc::Sender<CallSummary>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline-test.db");
        let pool = switchboard_db::create_pool(
            path.to_str().expect("utf-8 path"),
            switchboard_db::DbRuntimeSettings::default(),
        )
        .expect("test pool");
        {
            let conn = pool.get().expect("connection");
            switchboard_db::run_migrations(&conn).expect("migrations");
        }
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (updates_tx, updates) = mpsc::channel(16);
        Fixture {
            _dir: dir,
            pool,
            _shutdown_tx: shutdown_tx,
            shutdown,
            updates,
            updates_tx_for_new: Some(updates_tx),
        }
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            workers: 1,
            max_attempts: 3,
            retry_base_secs: 0,
            queue_capacity: 16,
            audio_dir: dir.join("audio"),
        }
    }

    fn pipeline<R, T, S>(
        f: &mut Fixture,
        recordings: R,
        transcriber: T,
        summarizer: S,
    ) -> Pipeline<R, T, S>
    where
        R: RecordingSource,
        T: Transcriber,
        S: Summarizer,
    {
        let updates_tx = f.updates_tx_for_new.take().expect("one pipeline per fixture");
        Pipeline::new(
            test_config(f._dir.path()),
            f.pool.clone(),
            recordings,
            transcriber,
            summarizer,
            updates_tx,
        )
    }

    fn good_recordings() -> &'static FakeRecordings {
        Box::leak(Box::new(FakeRecordings {
            downloads: AtomicU32::new(0),
            result: || Ok(vec![0u8; 128]),
        }))
    }

    fn good_summarizer() -> &'static FlakySummarizer {
        Box::leak(Box::new(FlakySummarizer {
            calls: AtomicU32::new(0),
            fail_first: 0,
        }))
    }

    #[tokio::test]
    async fn job_runs_all_stages_to_done() {
        let mut f = fixture();
        let p = pipeline(
            &mut f,
            good_recordings(),
            FakeTranscriber {
                transcript: "customer asked about an invoice",
            },
            good_summarizer(),
        );

        assert!(p.enqueue("c-1", "rec-1.wav").await.unwrap());
        p.process("c-1", &f.shutdown).await.unwrap();

        let conn = f.pool.get().unwrap();
        let job = db::get_summary(&conn, "c-1").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Done);
        assert_eq!(job.category, Some(CallCategory::Support));
        assert_eq!(job.topics, vec!["billing"]);
        assert!(job.audio_path.is_some());
        assert_eq!(job.attempts, 1);

        // Stage progress is forwarded in order, ending with the settled row.
        let mut statuses = Vec::new();
        while let Ok(update) = f.updates.try_recv() {
            assert_eq!(update.call_id, "c-1");
            statuses.push(update.status);
        }
        assert_eq!(
            statuses,
            vec![
                PipelineStatus::Downloading,
                PipelineStatus::Transcribing,
                PipelineStatus::Summarizing,
                PipelineStatus::Done,
            ]
        );
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_call() {
        let mut f = fixture();
        let p = pipeline(
            &mut f,
            good_recordings(),
            FakeTranscriber { transcript: "hi" },
            good_summarizer(),
        );
        assert!(p.enqueue("c-2", "rec.wav").await.unwrap());
        assert!(!p.enqueue("c-2", "rec.wav").await.unwrap());
    }

    #[tokio::test]
    async fn silent_recording_completes_without_summarizer() {
        let mut f = fixture();
        let summarizer = good_summarizer();
        let p = pipeline(
            &mut f,
            good_recordings(),
            FakeTranscriber { transcript: "   " },
            summarizer,
        );

        p.enqueue("c-3", "rec.wav").await.unwrap();
        p.process("c-3", &f.shutdown).await.unwrap();

        let conn = f.pool.get().unwrap();
        let job = db::get_summary(&conn, "c-3").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Done);
        assert_eq!(job.transcript.as_deref(), Some(NO_SPEECH_TRANSCRIPT));
        assert_eq!(job.category, Some(CallCategory::Other));
        assert_eq!(job.sentiment, Some(Sentiment::Neutral));
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resume_skips_completed_stages() {
        let mut f = fixture();
        let recordings = good_recordings();
        let p = pipeline(
            &mut f,
            recordings,
            FakeTranscriber { transcript: "hello" },
            good_summarizer(),
        );

        // Simulate a job interrupted after transcription: audio on disk,
        // transcript persisted, stage parked at summarizing.
        let audio = f._dir.path().join("c-4.wav");
        std::fs::write(&audio, b"riff").unwrap();
        {
            let conn = f.pool.get().unwrap();
            db::create_pending_summary(&conn, "c-4", "rec.wav").unwrap();
            db::record_audio_path(&conn, "c-4", audio.to_str().unwrap()).unwrap();
            db::record_transcript(&conn, "c-4", "customer asked about delivery").unwrap();
            db::set_summary_stage(&conn, "c-4", PipelineStatus::Summarizing, true).unwrap();
        }

        assert!(p.requeue("c-4").await.unwrap());
        p.process("c-4", &f.shutdown).await.unwrap();

        let conn = f.pool.get().unwrap();
        let job = db::get_summary(&conn, "c-4").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Done);
        assert_eq!(recordings.downloads.load(Ordering::SeqCst), 0, "no re-download");
        // The transcript written before the interruption survives.
        assert_eq!(job.transcript.as_deref(), Some("customer asked about delivery"));
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let mut f = fixture();
        let summarizer: &'static FlakySummarizer = Box::leak(Box::new(FlakySummarizer {
            calls: AtomicU32::new(0),
            fail_first: 1,
        }));
        let p = pipeline(
            &mut f,
            good_recordings(),
            FakeTranscriber { transcript: "hello" },
            summarizer,
        );

        p.enqueue("c-5", "rec.wav").await.unwrap();
        p.process("c-5", &f.shutdown).await.unwrap();

        let conn = f.pool.get().unwrap();
        let job = db::get_summary(&conn, "c-5").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Done);
        assert_eq!(job.attempts, 2);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn attempts_exhausted_marks_failed_with_reason() {
        let mut f = fixture();
        let summarizer: &'static FlakySummarizer = Box::leak(Box::new(FlakySummarizer {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        }));
        let p = pipeline(
            &mut f,
            good_recordings(),
            FakeTranscriber { transcript: "hello" },
            summarizer,
        );

        p.enqueue("c-6", "rec.wav").await.unwrap();
        p.process("c-6", &f.shutdown).await.unwrap();

        let conn = f.pool.get().unwrap();
        let job = db::get_summary(&conn, "c-6").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.failure_reason.as_deref().unwrap().contains("summarization"));

        let mut last = None;
        while let Ok(update) = f.updates.try_recv() {
            last = Some(update);
        }
        assert_eq!(last.expect("failed job forwarded").status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn missing_recording_fails_without_retry() {
        let mut f = fixture();
        let recordings: &'static FakeRecordings = Box::leak(Box::new(FakeRecordings {
            downloads: AtomicU32::new(0),
            result: || Err(PbxError::NotFound("rec.wav".into())),
        }));
        let p = pipeline(
            &mut f,
            recordings,
            FakeTranscriber { transcript: "hello" },
            good_summarizer(),
        );

        p.enqueue("c-7", "rec.wav").await.unwrap();
        p.process("c-7", &f.shutdown).await.unwrap();

        let conn = f.pool.get().unwrap();
        let job = db::get_summary(&conn, "c-7").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(recordings.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_job_can_be_reset_and_requeued() {
        let mut f = fixture();
        let p = pipeline(
            &mut f,
            good_recordings(),
            FakeTranscriber { transcript: "hello again" },
            good_summarizer(),
        );

        {
            let conn = f.pool.get().unwrap();
            db::create_pending_summary(&conn, "c-8", "rec.wav").unwrap();
            db::fail_summary(&conn, "c-8", "provider unavailable").unwrap();
        }

        // Without a reset the settled job is refused.
        assert!(!p.requeue("c-8").await.unwrap());

        {
            let conn = f.pool.get().unwrap();
            assert!(db::reset_summary_for_retry(&conn, "c-8").unwrap());
        }
        assert!(p.requeue("c-8").await.unwrap());
        p.process("c-8", &f.shutdown).await.unwrap();

        let conn = f.pool.get().unwrap();
        let job = db::get_summary(&conn, "c-8").unwrap().unwrap();
        assert_eq!(job.status, PipelineStatus::Done);
    }

    #[test]
    fn scratch_names_are_filesystem_safe() {
        assert_eq!(scratch_name("c-100"), "c-100");
        assert_eq!(scratch_name("../etc/passwd"), "___etc_passwd");
        assert_eq!(scratch_name("1692688888.123"), "1692688888_123");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let mut f = fixture();
        let mut config = test_config(f._dir.path());
        config.retry_base_secs = 5;
        let updates_tx = f.updates_tx_for_new.take().unwrap();
        let p = Pipeline::new(
            config,
            f.pool.clone(),
            good_recordings(),
            FakeTranscriber { transcript: "x" },
            good_summarizer(),
            updates_tx,
        );
        assert_eq!(p.backoff(1), Duration::from_secs(5));
        assert_eq!(p.backoff(2), Duration::from_secs(10));
        assert_eq!(p.backoff(3), Duration::from_secs(20));
    }
}
