//! Orchestration façade: submit a PDF, run it through planning, dispatch and
//! aggregation, and keep the record store and progress topic in step.
//!
//! Once a document reaches a terminal status every failure is captured in
//! its record and in the terminal progress event; `process` only returns an
//! error when the document cannot be found or the record store itself fails.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::Config;
use crate::aggregate::aggregate;
use crate::backend::{PdfBackend, PdfInfo};
use crate::dispatcher::Dispatcher;
use crate::extract::ExtractionBackend;
use crate::gate::ConcurrencyGate;
use crate::model::{
    ChunkProgress, Document, DocumentId, DocumentMetadata, DocumentUpdate, PageRange,
    ProcessingStatus,
};
use crate::planner::{ChunkPlanner, Plan};
use crate::progress::{ProgressTracker, Subscription};
use crate::store::{self, DocumentStore, ObjectStore, StoreError};
use crate::worker::{ChunkJob, ExtractionWorker, WorkerEvent};

pub const TIMEOUT_MESSAGE: &str = "Processing timeout - document too large or complex";
pub const INTERRUPTED_MESSAGE: &str = "Processing interrupted before completion";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("document {id} has no extracted text (status: {status})")]
    NotReady {
        id: String,
        status: ProcessingStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    fn document(id: &DocumentId) -> Self {
        PipelineError::NotFound {
            kind: "document",
            id: id.to_string(),
        }
    }

    fn file(locator: &str) -> Self {
        PipelineError::NotFound {
            kind: "stored file",
            id: locator.to_string(),
        }
    }
}

/// Final state of one `process` run.
#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub document: Document,
    /// Units dispatched: 1 for a single-unit document, 0 if planning failed.
    pub chunks: usize,
    pub failed_ranges: Vec<PageRange>,
    pub elapsed: Duration,
}

impl DocumentOutcome {
    pub fn status(&self) -> ProcessingStatus {
        self.document.status
    }
}

/// Collaborators injected into a [`Pipeline`].
pub struct PipelineParts {
    pub pdf: Arc<dyn PdfBackend>,
    pub extractor: Arc<dyn ExtractionBackend>,
    /// Shared cap on extraction calls across every document.
    pub gate: ConcurrencyGate,
    pub tracker: Arc<ProgressTracker>,
    pub documents: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStore>,
}

/// Terminal fields computed by one run, before they are written.
struct Finished {
    update: DocumentUpdate,
    chunks: usize,
    failed_ranges: Vec<PageRange>,
}

impl Finished {
    fn failed(message: impl Into<String>) -> Self {
        let mut update = DocumentUpdate::failed(message);
        update.text = Some(None);
        Self {
            update,
            chunks: 0,
            failed_ranges: Vec::new(),
        }
    }
}

/// Fails the record and cancels outstanding chunks if a `process` future is
/// dropped before it reaches a terminal status.
struct InterruptGuard<'a> {
    pipeline: &'a Pipeline,
    id: &'a DocumentId,
    cancel: CancellationToken,
    started: Instant,
    armed: bool,
}

impl InterruptGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        tracing::warn!(document_id = %self.id, "processing interrupted");
        let update = DocumentUpdate::failed(INTERRUPTED_MESSAGE)
            .with_processing_time(self.started.elapsed().as_secs_f64());
        if let Err(e) = self.pipeline.documents.update(self.id, update) {
            tracing::error!(document_id = %self.id, error = %e, "failed to record interruption");
        }
        self.pipeline.tracker.mark_failed(self.id, INTERRUPTED_MESSAGE);
    }
}

pub struct Pipeline {
    planner: ChunkPlanner,
    pdf: Arc<dyn PdfBackend>,
    dispatcher: Dispatcher,
    tracker: Arc<ProgressTracker>,
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    soft_time_limit: Duration,
}

impl Pipeline {
    pub fn new(config: &Config, parts: PipelineParts) -> Self {
        let worker = ExtractionWorker::new(
            parts.extractor,
            parts.gate,
            config.extraction_timeout(),
            config.retry_policy(),
        );
        Self {
            planner: config.planner(),
            pdf: parts.pdf,
            dispatcher: Dispatcher::new(Arc::new(worker), config.per_document_concurrency),
            tracker: parts.tracker,
            documents: parts.documents,
            objects: parts.objects,
            soft_time_limit: config.soft_time_limit(),
        }
    }

    /// Build a pipeline with the stores, gate and tracker described by `config`.
    pub fn open(
        config: &Config,
        pdf: Arc<dyn PdfBackend>,
        extractor: Arc<dyn ExtractionBackend>,
    ) -> Result<Self, StoreError> {
        let parts = PipelineParts {
            pdf,
            extractor,
            gate: ConcurrencyGate::new(config.global_concurrency),
            tracker: Arc::new(ProgressTracker::new(config.progress_ttl())),
            documents: store::open_document_store(&config.storage)?,
            objects: store::open_object_store(&config.storage)?,
        };
        Ok(Self::new(config, parts))
    }

    pub fn planner(&self) -> &ChunkPlanner {
        &self.planner
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Store `bytes` and create a queued record for them.
    pub fn submit(&self, bytes: &[u8], filename: &str) -> Result<Document, PipelineError> {
        let locator = self.objects.put(bytes)?;
        let document = Document::queued(
            DocumentId::generate(),
            filename,
            locator,
            bytes.len() as u64,
        );
        if let Err(e) = self.documents.create(&document) {
            let _ = self.objects.delete(&document.locator);
            return Err(e.into());
        }
        tracing::info!(document_id = %document.id, filename, bytes = bytes.len(), "document submitted");
        Ok(document)
    }

    pub fn get(&self, id: &DocumentId) -> Result<Document, PipelineError> {
        self.documents
            .get(id)?
            .ok_or_else(|| PipelineError::document(id))
    }

    /// All records, newest first.
    pub fn list(&self) -> Result<Vec<Document>, PipelineError> {
        Ok(self.documents.list()?)
    }

    /// Extracted text of a completed or partially completed document.
    pub fn text(&self, id: &DocumentId) -> Result<String, PipelineError> {
        let document = self.get(id)?;
        if !document.status.has_text() {
            return Err(PipelineError::NotReady {
                id: id.to_string(),
                status: document.status,
            });
        }
        Ok(document.text.unwrap_or_default())
    }

    /// Remove the stored bytes, the record and any progress state.
    pub fn delete(&self, id: &DocumentId) -> Result<(), PipelineError> {
        let document = self.get(id)?;
        if !self.objects.delete(&document.locator)? {
            tracing::warn!(document_id = %id, locator = %document.locator, "stored file already gone");
        }
        self.documents.delete(id)?;
        self.tracker.clear(id);
        tracing::info!(document_id = %id, "document deleted");
        Ok(())
    }

    /// Follow a document's progress topic.
    ///
    /// A document that finished before this process started has no live
    /// topic; its terminal event is replayed from the record instead.
    pub fn subscribe(&self, id: &DocumentId) -> Result<Subscription, PipelineError> {
        let document = self.get(id)?;
        if document.status.is_terminal() && !self.tracker.is_tracked(id) {
            if document.status.has_text() {
                self.tracker.mark_completed(id, document.status);
            } else {
                let error = document
                    .error
                    .unwrap_or_else(|| document.status.to_string());
                self.tracker.mark_failed(id, &error);
            }
        }
        Ok(self.tracker.subscribe(id))
    }

    /// Reset a document to queued and process it again.
    pub async fn reprocess(&self, id: &DocumentId) -> Result<DocumentOutcome, PipelineError> {
        let document = self.get(id)?;
        if !self.objects.exists(&document.locator)? {
            return Err(PipelineError::file(&document.locator));
        }
        self.tracker.clear(id);
        self.documents.update(
            id,
            DocumentUpdate {
                status: Some(ProcessingStatus::Queued),
                text: Some(None),
                confidence: Some(None),
                metadata: Some(None),
                error: Some(None),
                processing_time_secs: Some(None),
                ..DocumentUpdate::default()
            },
        )?;
        tracing::info!(document_id = %id, "reprocessing document");
        self.process(id).await
    }

    /// Run a submitted document to a terminal status under the soft time limit.
    ///
    /// Dropping the returned future before it resolves cancels the remaining
    /// chunks and records the document as failed.
    pub async fn process(&self, id: &DocumentId) -> Result<DocumentOutcome, PipelineError> {
        self.tracker.sweep_expired();
        let document = self.get(id)?;
        let bytes = self
            .objects
            .get(&document.locator)?
            .ok_or_else(|| PipelineError::file(&document.locator))?;
        // A topic closed by an earlier run would swallow this run's terminal event.
        self.tracker.clear_closed(id);

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let guard = InterruptGuard {
            pipeline: self,
            id,
            cancel: cancel.clone(),
            started,
            armed: true,
        };
        let result =
            tokio::time::timeout(self.soft_time_limit, self.run(&document, bytes, cancel.clone()))
                .await;
        guard.disarm();

        let finished = match result {
            Ok(Ok(finished)) => finished,
            Ok(Err(e)) => {
                tracing::error!(document_id = %id, error = %e, "record store failed during processing");
                let message = format!("Storage error: {e}");
                let _ = self.documents.update(
                    id,
                    DocumentUpdate::failed(message.clone())
                        .with_processing_time(started.elapsed().as_secs_f64()),
                );
                self.tracker.mark_failed(id, &message);
                return Err(e.into());
            }
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    document_id = %id,
                    limit_secs = self.soft_time_limit.as_secs(),
                    "soft time limit exceeded"
                );
                Finished::failed(TIMEOUT_MESSAGE)
            }
        };

        let elapsed = started.elapsed();
        let status = finished.update.status.unwrap_or(ProcessingStatus::Error);
        let error = finished.update.error.clone().flatten();
        let document = self.documents.update(
            id,
            finished.update.with_processing_time(elapsed.as_secs_f64()),
        )?;

        if status == ProcessingStatus::Error {
            self.tracker
                .mark_failed(id, error.as_deref().unwrap_or("processing failed"));
        } else {
            self.tracker.mark_completed(id, status);
        }
        tracing::info!(
            document_id = %id,
            %status,
            chunks = finished.chunks,
            failed = finished.failed_ranges.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "document processed"
        );

        Ok(DocumentOutcome {
            document,
            chunks: finished.chunks,
            failed_ranges: finished.failed_ranges,
            elapsed,
        })
    }

    async fn run(
        &self,
        document: &Document,
        bytes: Vec<u8>,
        cancel: CancellationToken,
    ) -> Result<Finished, StoreError> {
        let id = &document.id;
        self.documents
            .update(id, DocumentUpdate::status(ProcessingStatus::Extracting))?;

        let planner = self.planner;
        let pdf = Arc::clone(&self.pdf);
        let planned = tokio::task::spawn_blocking(move || {
            let plan = planner.plan(&bytes, pdf.as_ref());
            (plan, bytes)
        })
        .await;
        let (plan, bytes) = match planned {
            Ok(planned) => planned,
            Err(e) => return Ok(Finished::failed(format!("Failed to plan document: {e}"))),
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(document_id = %id, error = %e, "planning failed");
                return Ok(Finished::failed(format!("Failed to read PDF: {e}")));
            }
        };

        match plan {
            Plan::Single { info } => self.run_single(id, Arc::from(bytes), info).await,
            Plan::Chunked { info, chunks } => {
                drop(bytes);
                let total = chunks.len();
                let jobs = chunks
                    .into_iter()
                    .map(|chunk| ChunkJob::chunk(chunk, total))
                    .collect();
                self.run_chunked(id, info, jobs, cancel).await
            }
        }
    }

    /// One extraction call for the whole document. No per-chunk progress is
    /// published; the terminal event alone reports the result.
    async fn run_single(
        &self,
        id: &DocumentId,
        payload: Arc<[u8]>,
        info: PdfInfo,
    ) -> Result<Finished, StoreError> {
        self.documents.update(
            id,
            DocumentUpdate {
                page_count: Some(info.page_count),
                ..DocumentUpdate::default()
            },
        )?;
        let job = ChunkJob::whole(payload, info.page_count);
        let on_event = |_: WorkerEvent| {};
        let run = AssertUnwindSafe(self.dispatcher.worker().run(&job, &on_event));
        let outcome = match run.catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(document_id = %id, "extraction worker panicked");
                let mut finished = Finished::failed("Extraction worker panicked");
                finished.chunks = 1;
                finished.failed_ranges = vec![job.range];
                return Ok(finished);
            }
        };

        let extraction = match outcome.result {
            Ok(extraction) => extraction,
            Err(e) => {
                let mut finished = Finished::failed(e.to_string());
                finished.chunks = 1;
                finished.failed_ranges = vec![outcome.range];
                return Ok(finished);
            }
        };
        let summary = extraction.summary;
        let metadata = DocumentMetadata {
            page_count: if summary.page_count > 0 {
                summary.page_count
            } else {
                info.page_count
            },
            has_handwriting: summary.has_handwriting,
            quality: summary.confidence,
            file_size: info.byte_size,
            extraction_notes: summary.notes,
            ..DocumentMetadata::default()
        };
        Ok(Finished {
            update: DocumentUpdate {
                status: Some(ProcessingStatus::Completed),
                text: Some(Some(extraction.text)),
                confidence: Some(Some(summary.confidence)),
                metadata: Some(Some(metadata)),
                error: Some(None),
                ..DocumentUpdate::default()
            },
            chunks: 1,
            failed_ranges: Vec::new(),
        })
    }

    async fn run_chunked(
        &self,
        id: &DocumentId,
        info: PdfInfo,
        jobs: Vec<ChunkJob>,
        cancel: CancellationToken,
    ) -> Result<Finished, StoreError> {
        let total = jobs.len();
        self.documents.update(
            id,
            DocumentUpdate {
                status: Some(ProcessingStatus::ProcessingChunks),
                page_count: Some(info.page_count),
                metadata: Some(Some(DocumentMetadata {
                    page_count: info.page_count,
                    file_size: info.byte_size,
                    is_chunked: true,
                    chunk_size: Some(self.planner.chunk_size()),
                    chunk_progress: Some(ChunkProgress::new(total)),
                    ..DocumentMetadata::default()
                })),
                ..DocumentUpdate::default()
            },
        )?;

        let subscription = self.tracker.subscribe(id);
        self.tracker.initialize(id, total);
        // The persister runs inside this future and stops when it is dropped.
        let stop = cancel.child_token();
        let dispatch = async {
            let outcomes = self
                .dispatcher
                .dispatch(id, jobs, Arc::clone(&self.tracker), cancel)
                .await;
            stop.cancel();
            outcomes
        };
        let (outcomes, ()) = tokio::join!(
            dispatch,
            persist_progress(subscription, Arc::clone(&self.documents), stop.clone())
        );

        let aggregate = match aggregate(total, outcomes) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                tracing::error!(document_id = %id, error = %e, "aggregation failed");
                let mut finished = Finished::failed(format!("Failed to aggregate results: {e}"));
                finished.chunks = total;
                return Ok(finished);
            }
        };

        let has_text = aggregate.status.has_text();
        let metadata = DocumentMetadata {
            page_count: info.page_count,
            has_handwriting: aggregate.has_handwriting,
            quality: aggregate.confidence,
            file_size: info.byte_size,
            extraction_notes: Some(aggregate.notes),
            is_chunked: true,
            chunk_size: Some(self.planner.chunk_size()),
            chunk_progress: self.tracker.read(id),
            ..DocumentMetadata::default()
        };
        Ok(Finished {
            update: DocumentUpdate {
                status: Some(aggregate.status),
                text: Some(has_text.then_some(aggregate.text)),
                confidence: Some(has_text.then_some(aggregate.confidence)),
                metadata: Some(Some(metadata)),
                error: Some(aggregate.error),
                ..DocumentUpdate::default()
            },
            chunks: total,
            failed_ranges: aggregate.failed_ranges,
        })
    }
}

/// Mirror live chunk snapshots into the record until `stop` fires or the
/// topic ends.
async fn persist_progress(
    mut subscription: Subscription,
    documents: Arc<dyn DocumentStore>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = subscription.next() => event,
        };
        let Some(event) = event else { break };
        if event.kind.is_terminal() {
            break;
        }
        if event.snapshot.total == 0 {
            continue;
        }
        let update = DocumentUpdate {
            chunk_progress: Some(event.snapshot),
            ..DocumentUpdate::default()
        };
        if let Err(e) = documents.update(&event.document_id, update) {
            tracing::warn!(document_id = %event.document_id, error = %e, "failed to persist chunk progress");
        }
    }
}
