//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// PBX provider connection settings.
    #[serde(default)]
    pub pbx: PbxSettings,

    /// CDR reconciliation settings.
    #[serde(default)]
    pub sync: SyncSettings,

    /// Post-call pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Transcription settings.
    #[serde(default)]
    pub stt: SttSettings,

    /// Summarization model settings.
    #[serde(default)]
    pub summarizer: SummarizerSettings,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Busy timeout for SQLite connections, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// PBX provider settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PbxSettings {
    /// Base URL of the provider API.
    #[serde(default = "default_pbx_base_url")]
    pub base_url: String,

    /// OpenAPI client id.
    #[serde(default)]
    pub client_id: String,

    /// OpenAPI client secret.
    #[serde(default)]
    pub client_secret: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_pbx_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Shared secret webhook callers and WebSocket clients must present.
    #[serde(default)]
    pub webhook_token: String,
}

/// CDR reconciliation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Seconds between reconciliation passes.
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,

    /// Backoff ceiling when the provider is unavailable.
    #[serde(default = "default_sync_max_interval_secs")]
    pub max_interval_secs: u64,

    /// Records per CDR search page.
    #[serde(default = "default_sync_page_size")]
    pub page_size: u32,

    /// Lookback window for the first pass, in seconds.
    #[serde(default = "default_sync_lookback_secs")]
    pub lookback_secs: i64,
}

/// Post-call pipeline settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Concurrent pipeline workers.
    #[serde(default = "default_pipeline_workers")]
    pub workers: usize,

    /// Attempts per job before it is marked failed.
    #[serde(default = "default_pipeline_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in seconds; doubles per attempt.
    #[serde(default = "default_pipeline_retry_base_secs")]
    pub retry_base_secs: u64,

    /// Bound of the in-process job queue.
    #[serde(default = "default_pipeline_queue_capacity")]
    pub queue_capacity: usize,

    /// Scratch directory for downloaded audio.
    #[serde(default = "default_audio_dir")]
    pub audio_dir: String,

    /// Whether extension-to-extension calls are auto-processed. Off by
    /// default; internal chatter rarely needs a summary.
    #[serde(default)]
    pub process_internal_calls: bool,
}

/// Transcription settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SttSettings {
    /// Path to the whisper.cpp-style binary.
    #[serde(default = "default_stt_binary")]
    pub binary_path: String,

    /// Path to the GGML model file.
    #[serde(default = "default_stt_model")]
    pub model_path: String,

    /// Forced language hint; autodetect when empty.
    #[serde(default)]
    pub language: String,
}

/// Summarization model settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerSettings {
    /// Base URL of the model server.
    #[serde(default = "default_summarizer_base_url")]
    pub base_url: String,

    /// Model name.
    #[serde(default = "default_summarizer_model")]
    pub model: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_summarizer_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "switchboard_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "switchboard.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_pbx_base_url() -> String {
    "https://localhost".to_string()
}

fn default_pbx_timeout_secs() -> u64 {
    30
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_sync_max_interval_secs() -> u64 {
    1800
}

fn default_sync_page_size() -> u32 {
    100
}

fn default_sync_lookback_secs() -> i64 {
    3600
}

fn default_pipeline_workers() -> usize {
    2
}

fn default_pipeline_max_attempts() -> u32 {
    3
}

fn default_pipeline_retry_base_secs() -> u64 {
    5
}

fn default_pipeline_queue_capacity() -> usize {
    256
}

fn default_audio_dir() -> String {
    "/var/tmp/switchboard-audio".to_string()
}

fn default_stt_binary() -> String {
    "whisper-cli".to_string()
}

fn default_stt_model() -> String {
    "models/ggml-base.bin".to_string()
}

fn default_summarizer_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_summarizer_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_summarizer_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for PbxSettings {
    fn default() -> Self {
        Self {
            base_url: default_pbx_base_url(),
            client_id: String::new(),
            client_secret: String::new(),
            request_timeout_secs: default_pbx_timeout_secs(),
            webhook_token: String::new(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            max_interval_secs: default_sync_max_interval_secs(),
            page_size: default_sync_page_size(),
            lookback_secs: default_sync_lookback_secs(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: default_pipeline_workers(),
            max_attempts: default_pipeline_max_attempts(),
            retry_base_secs: default_pipeline_retry_base_secs(),
            queue_capacity: default_pipeline_queue_capacity(),
            audio_dir: default_audio_dir(),
            process_internal_calls: false,
        }
    }
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            binary_path: default_stt_binary(),
            model_path: default_stt_model(),
            language: String::new(),
        }
    }
}

impl Default for SummarizerSettings {
    fn default() -> Self {
        Self {
            base_url: default_summarizer_base_url(),
            model: default_summarizer_model(),
            request_timeout_secs: default_summarizer_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `SWITCHBOARD_HOST` overrides `server.host`
/// - `SWITCHBOARD_PORT` overrides `server.port`
/// - `SWITCHBOARD_DB_PATH` overrides `database.path`
/// - `SWITCHBOARD_PBX_BASE_URL` overrides `pbx.base_url`
/// - `SWITCHBOARD_PBX_CLIENT_ID` overrides `pbx.client_id`
/// - `SWITCHBOARD_PBX_CLIENT_SECRET` overrides `pbx.client_secret`
/// - `SWITCHBOARD_WEBHOOK_TOKEN` overrides `pbx.webhook_token`
/// - `SWITCHBOARD_LOG_LEVEL` overrides `logging.level`
/// - `SWITCHBOARD_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("SWITCHBOARD_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("SWITCHBOARD_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("SWITCHBOARD_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(base_url) = std::env::var("SWITCHBOARD_PBX_BASE_URL") {
        config.pbx.base_url = base_url;
    }
    if let Ok(client_id) = std::env::var("SWITCHBOARD_PBX_CLIENT_ID") {
        config.pbx.client_id = client_id;
    }
    if let Ok(client_secret) = std::env::var("SWITCHBOARD_PBX_CLIENT_SECRET") {
        config.pbx.client_secret = client_secret;
    }
    if let Ok(token) = std::env::var("SWITCHBOARD_WEBHOOK_TOKEN") {
        config.pbx.webhook_token = token;
    }
    if let Ok(level) = std::env::var("SWITCHBOARD_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("SWITCHBOARD_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
