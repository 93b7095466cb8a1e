use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod aggregate;
pub mod backend;
pub mod config_file;
pub mod dispatcher;
pub mod extract;
pub mod gate;
pub mod model;
pub mod parse;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod worker;

// Re-export for convenience
pub use aggregate::{Aggregate, AggregationError, aggregate, overall_confidence};
pub use backend::{BackendError, PdfBackend, PdfInfo};
pub use dispatcher::{Dispatcher, JobGroup};
pub use extract::{ExtractionBackend, ExtractionError, ExtractionRequest, GeminiBackend};
pub use gate::{ConcurrencyGate, GatePermit};
pub use model::{
    ChunkProgress, ChunkStatus, Confidence, Document, DocumentId, DocumentMetadata,
    DocumentUpdate, PageRange, ProcessingStatus, ProgressEvent, ProgressEventKind,
};
pub use pipeline::{DocumentOutcome, Pipeline, PipelineError, PipelineParts};
pub use planner::{ChunkPlanner, Plan, PlanError, PlannedChunk};
pub use progress::{DEFAULT_PROGRESS_TTL, ProgressTracker, Subscription};
pub use rate_limit::AdaptiveRateLimiter;
pub use retry::{FailureClass, RetryPolicy, backoff_delay};
pub use store::{DocumentStore, ObjectStore, StorageBackend, StoreError};
pub use worker::{ChunkJob, ChunkOutcome, ExtractionWorker};

/// Where records and uploads live.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
}

/// Platform data directory for pagewise: `<data_dir>/pagewise`.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pagewise")
}

impl Default for StorageConfig {
    fn default() -> Self {
        let root = data_dir();
        Self {
            backend: StorageBackend::default(),
            database_path: root.join("documents.db"),
            upload_dir: root.join("uploads"),
        }
    }
}

/// Every tunable of the pipeline.
#[derive(Clone)]
pub struct Config {
    /// Pages per chunk.
    pub chunk_size_pages: usize,
    /// Chunk when the page count exceeds this.
    pub page_threshold: usize,
    /// Chunk when the file size in MiB exceeds this.
    pub size_threshold_mb: f64,
    /// Chunks of one document in flight at once.
    pub per_document_concurrency: usize,
    /// Extraction calls in flight across all documents.
    pub global_concurrency: usize,
    /// Optional pacing of the HTTP extraction backend.
    pub requests_per_minute: Option<u32>,
    pub extraction_timeout_secs: u64,
    pub max_attempts: u32,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Whole-document limit; exceeding it marks the document as failed.
    pub soft_time_limit_secs: u64,
    pub progress_ttl_secs: u64,
    pub storage: StorageConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("chunk_size_pages", &self.chunk_size_pages)
            .field("page_threshold", &self.page_threshold)
            .field("size_threshold_mb", &self.size_threshold_mb)
            .field("per_document_concurrency", &self.per_document_concurrency)
            .field("global_concurrency", &self.global_concurrency)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("extraction_timeout_secs", &self.extraction_timeout_secs)
            .field("max_attempts", &self.max_attempts)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("soft_time_limit_secs", &self.soft_time_limit_secs)
            .field("progress_ttl_secs", &self.progress_ttl_secs)
            .field("storage", &self.storage)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size_pages: 20,
            page_threshold: 50,
            size_threshold_mb: 5.0,
            per_document_concurrency: 4,
            global_concurrency: 4,
            requests_per_minute: None,
            extraction_timeout_secs: 120,
            max_attempts: retry::DEFAULT_MAX_ATTEMPTS,
            model: extract::gemini::DEFAULT_MODEL.to_string(),
            api_key: None,
            temperature: 0.0,
            max_output_tokens: 65_536,
            soft_time_limit_secs: 3300,
            progress_ttl_secs: DEFAULT_PROGRESS_TTL.as_secs(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn planner(&self) -> ChunkPlanner {
        ChunkPlanner::new(
            self.chunk_size_pages,
            self.page_threshold,
            self.size_threshold_mb,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    /// Never shorter than the soft time limit, so a document still being
    /// processed cannot be swept from the tracker.
    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs.max(self.soft_time_limit_secs))
    }
}

/// Build the Gemini backend described by `config`.
///
/// The client timeout sits slightly above the worker's hard timeout so the
/// worker's own deadline is the one that fires.
pub fn build_gemini_backend(config: &Config, client: reqwest::Client) -> GeminiBackend {
    let mut backend = GeminiBackend::new(client, config.api_key.clone())
        .with_model(config.model.clone())
        .with_generation(config.temperature, config.max_output_tokens)
        .with_timeout(config.extraction_timeout() + Duration::from_secs(5));
    if let Some(rpm) = config.requests_per_minute {
        tracing::debug!(rpm, "pacing extraction requests");
        backend = backend.with_rate_limiter(Arc::new(AdaptiveRateLimiter::per_minute(rpm)));
    }
    backend
}
