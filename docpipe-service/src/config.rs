//! Service configuration.
//!
//! Loaded once at startup from an optional `config` file and `DOCPIPE__*`
//! environment variables (see [`loader`]).

mod loader;

pub use loader::load_config;

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub parser: ParserConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest accepted document upload
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL under which `/objects/...` presigned links are served
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Secret for signing presigned URLs. Unset means a development secret.
    #[serde(default)]
    pub presign_secret: Option<String>,

    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,
}

impl StorageConfig {
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            public_base_url: default_public_base_url(),
            presign_secret: None,
            presign_ttl_secs: default_presign_ttl_secs(),
        }
    }
}

/// SQLite configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_file")]
    pub file_name: String,

    /// How long a unit of work waits for another writer's lease
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file_name: default_db_file(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Inference service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_inference_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_summarize_timeout_secs")]
    pub summarize_timeout_secs: u64,

    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,

    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_inference_url(),
            api_token: None,
            summarize_timeout_secs: default_summarize_timeout_secs(),
            embed_timeout_secs: default_embed_timeout_secs(),
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

/// Which parsing collaborator to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    #[default]
    PlainText,
    Http,
}

/// Parsing collaborator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    #[serde(default)]
    pub kind: ParserKind,

    #[serde(default = "default_parser_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_token: Option<String>,

    #[serde(default = "default_parser_timeout_secs")]
    pub timeout_secs: u64,

    /// Soft cap on chunk size for the built-in plain text parser
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            kind: ParserKind::default(),
            base_url: default_parser_url(),
            api_token: None,
            timeout_secs: default_parser_timeout_secs(),
            max_chunk_chars: default_max_chunk_chars(),
        }
    }
}

/// Task queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// What happens to a project when one of its documents fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectFailurePolicy {
    /// Leave the project alone; it simply never reaches ready
    #[default]
    Ignore,
    /// Mark the project failed together with the document
    MarkFailed,
}

/// Pipeline behaviour switches
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Call the summarizer even for chunks without images
    #[serde(default)]
    pub summarize_without_images: bool,

    #[serde(default)]
    pub project_failure_policy: ProjectFailurePolicy,
}

// ==================== Default Value Functions ====================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_upload_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_presign_ttl_secs() -> u64 {
    15 * 60
}

fn default_db_file() -> String {
    "docpipe.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_inference_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_summarize_timeout_secs() -> u64 {
    500
}

fn default_embed_timeout_secs() -> u64 {
    100
}

fn default_embedding_dimensions() -> usize {
    384
}

fn default_parser_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_parser_timeout_secs() -> u64 {
    300
}

fn default_max_chunk_chars() -> usize {
    2000
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    10
}

fn default_backoff_max_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    1000
}
