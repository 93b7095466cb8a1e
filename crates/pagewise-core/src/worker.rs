//! Per-chunk execution: gated, time-bounded calls with class-specific retry.

use std::sync::Arc;
use std::time::Duration;

use crate::extract::prompt::{chunk_prompt, document_prompt};
use crate::extract::{ExtractionBackend, ExtractionError, ExtractionRequest};
use crate::gate::ConcurrencyGate;
use crate::model::PageRange;
use crate::parse::{ExtractionSummary, parse_extraction};
use crate::planner::PlannedChunk;
use crate::retry::{AttemptOutcome, FailureClass, RetryPolicy};

/// One unit of extraction work.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    /// 1-based chunk index; always 1 for a single-unit document.
    pub index: usize,
    pub range: PageRange,
    pub request: ExtractionRequest,
}

impl ChunkJob {
    /// Job for chunk `chunk.index` of `total`.
    pub fn chunk(chunk: PlannedChunk, total: usize) -> Self {
        let label = format!("chunk {} of {}", chunk.index, total);
        let prompt = chunk_prompt(&label, chunk.range);
        Self {
            index: chunk.index,
            range: chunk.range,
            request: ExtractionRequest {
                payload: Arc::from(chunk.payload),
                pages: Some(chunk.range),
                label,
                prompt,
            },
        }
    }

    /// Job covering an entire document sent as one unit.
    pub fn whole(payload: Arc<[u8]>, page_count: usize) -> Self {
        Self {
            index: 1,
            range: PageRange::new(1, page_count.max(1)),
            request: ExtractionRequest {
                payload,
                pages: None,
                label: "document".to_string(),
                prompt: document_prompt(),
            },
        }
    }
}

/// Parsed output of a successful chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkExtraction {
    pub text: String,
    pub summary: ExtractionSummary,
}

/// Terminal result of one chunk job.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    pub index: usize,
    pub range: PageRange,
    pub attempts: u32,
    pub result: Result<ChunkExtraction, ExtractionError>,
}

impl ChunkOutcome {
    /// A failure recorded without any call being made (cancelled, panicked).
    pub fn failed(job: &ChunkJob, attempts: u32, message: impl Into<String>) -> Self {
        Self {
            index: job.index,
            range: job.range,
            attempts,
            result: Err(ExtractionError::Other(message.into())),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error_message(&self) -> Option<String> {
        self.result.as_ref().err().map(ToString::to_string)
    }
}

/// State changes reported while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Started,
    Retrying {
        attempt: u32,
        class: FailureClass,
        error: String,
        wait: Duration,
    },
    Succeeded,
    Failed {
        error: String,
    },
}

/// Callback receiving [`WorkerEvent`]s.
pub type WorkerEventFn<'a> = dyn Fn(WorkerEvent) + Send + Sync + 'a;

pub struct ExtractionWorker {
    backend: Arc<dyn ExtractionBackend>,
    gate: ConcurrencyGate,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ExtractionWorker {
    pub fn new(
        backend: Arc<dyn ExtractionBackend>,
        gate: ConcurrencyGate,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            gate,
            timeout,
            retry,
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run `job` to a terminal outcome. Never panics on extraction failure and
    /// never makes more than `max_attempts` calls.
    pub async fn run(&self, job: &ChunkJob, on_event: &WorkerEventFn<'_>) -> ChunkOutcome {
        on_event(WorkerEvent::Started);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.attempt(job).await;
            match AttemptOutcome::from_result(result, ExtractionError::class) {
                AttemptOutcome::Success(text) => {
                    let summary = parse_extraction(&text);
                    tracing::debug!(
                        chunk = job.index,
                        attempt,
                        pages = summary.page_count,
                        confidence = %summary.confidence,
                        "chunk extracted"
                    );
                    on_event(WorkerEvent::Succeeded);
                    return ChunkOutcome {
                        index: job.index,
                        range: job.range,
                        attempts: attempt,
                        result: Ok(ChunkExtraction { text, summary }),
                    };
                }
                AttemptOutcome::Retryable { class, error } if self.retry.allows_another(attempt) => {
                    let wait = self
                        .retry
                        .wait(class, attempt, error.retry_after(), fastrand::f64());
                    tracing::warn!(
                        chunk = job.index,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        %class,
                        wait_ms = wait.as_millis() as u64,
                        error = %error,
                        "extraction attempt failed, retrying"
                    );
                    on_event(WorkerEvent::Retrying {
                        attempt,
                        class,
                        error: error.to_string(),
                        wait,
                    });
                    tokio::time::sleep(wait).await;
                }
                AttemptOutcome::Retryable { error, .. } | AttemptOutcome::Fatal(error) => {
                    tracing::warn!(
                        chunk = job.index,
                        attempt,
                        class = %error.class(),
                        error = %error,
                        "chunk failed"
                    );
                    on_event(WorkerEvent::Failed {
                        error: error.to_string(),
                    });
                    return ChunkOutcome {
                        index: job.index,
                        range: job.range,
                        attempts: attempt,
                        result: Err(error),
                    };
                }
            }
        }
    }

    /// One gated, time-bounded call. The gate slot is not held during backoff.
    async fn attempt(&self, job: &ChunkJob) -> Result<String, ExtractionError> {
        let _permit = self.gate.acquire().await;
        match tokio::time::timeout(self.timeout, self.backend.extract(&job.request)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(self.timeout)),
        }
    }
}
