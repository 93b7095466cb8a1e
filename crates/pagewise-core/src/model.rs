//! Domain types shared by every stage of the extraction pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, unique document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive, 1-based page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of pages covered by the range.
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Lifecycle of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }
}

/// Document-level processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Queued,
    Extracting,
    ProcessingChunks,
    Completed,
    PartialError,
    Error,
    Cancelled,
}

impl ProcessingStatus {
    /// Terminal statuses: no further chunk processing occurs.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed
                | ProcessingStatus::PartialError
                | ProcessingStatus::Error
                | ProcessingStatus::Cancelled
        )
    }

    /// Whether the document carries usable extracted text.
    pub fn has_text(self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::PartialError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Extracting => "extracting",
            ProcessingStatus::ProcessingChunks => "processing_chunks",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::PartialError => "partial_error",
            ProcessingStatus::Error => "error",
            ProcessingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ProcessingStatus::Pending,
            "queued" => ProcessingStatus::Queued,
            "extracting" => ProcessingStatus::Extracting,
            "processing_chunks" => ProcessingStatus::ProcessingChunks,
            "completed" => ProcessingStatus::Completed,
            "partial_error" => ProcessingStatus::PartialError,
            "error" => ProcessingStatus::Error,
            "cancelled" => ProcessingStatus::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-reported extraction confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Parse a label case-insensitively (`High`, `medium`, `LOW`).
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Confidence::High),
            "medium" => Some(Confidence::Medium),
            "low" => Some(Confidence::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate snapshot of chunk states for one document.
///
/// `completed + failed + processing` never exceeds `total`; the remainder is pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub processing: usize,
}

impl ChunkProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn pending(&self) -> usize {
        self.total
            .saturating_sub(self.completed + self.failed + self.processing)
    }

    /// Chunks that have left the pending state.
    pub fn touched(&self) -> usize {
        self.completed + self.failed + self.processing
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    /// `(completed + failed) / total × 100`, or 0 for an empty document.
    pub fn overall_progress(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.finished() as f64 / self.total as f64) * 100.0
        }
    }

    pub fn is_done(&self) -> bool {
        self.total > 0 && self.finished() == self.total
    }
}

/// Kind of a published progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    Initialized,
    Progress,
    ChunkCompleted,
    Completed,
    Error,
}

impl ProgressEventKind {
    /// Terminal kinds close the document's topic.
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressEventKind::Completed | ProgressEventKind::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressEventKind::Initialized => "initialized",
            ProgressEventKind::Progress => "progress",
            ProgressEventKind::ChunkCompleted => "chunk_completed",
            ProgressEventKind::Completed => "completed",
            ProgressEventKind::Error => "error",
        }
    }
}

/// One entry in a document's progress topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Per-document emission sequence number, starting at 1.
    /// Snapshots handed to new subscribers repeat the latest emitted sequence.
    pub seq: u64,
    pub document_id: DocumentId,
    pub kind: ProgressEventKind,
    pub chunk_index: Option<usize>,
    pub chunk_status: Option<ChunkStatus>,
    pub snapshot: ChunkProgress,
    pub overall_progress: f64,
    /// Final document status, set on terminal events only.
    pub status: Option<ProcessingStatus>,
    pub error: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

/// Metadata recorded alongside the extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub page_count: usize,
    pub has_handwriting: bool,
    pub quality: Confidence,
    pub file_size: u64,
    pub mime_type: String,
    pub extraction_notes: Option<String>,
    pub is_chunked: bool,
    pub chunk_size: Option<usize>,
    pub chunk_progress: Option<ChunkProgress>,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            page_count: 0,
            has_handwriting: false,
            quality: Confidence::Medium,
            file_size: 0,
            mime_type: "application/pdf".to_string(),
            extraction_notes: None,
            is_chunked: false,
            chunk_size: None,
            chunk_progress: None,
        }
    }
}

/// Persisted document record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub filename: String,
    /// Locator of the original bytes in the object store.
    pub locator: String,
    pub byte_size: u64,
    pub page_count: Option<usize>,
    pub status: ProcessingStatus,
    pub text: Option<String>,
    pub confidence: Option<Confidence>,
    pub metadata: Option<DocumentMetadata>,
    pub error: Option<String>,
    pub processing_time_secs: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly queued record for bytes stored under `locator`.
    pub fn queued(id: DocumentId, filename: &str, locator: String, byte_size: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            filename: filename.to_string(),
            locator,
            byte_size,
            page_count: None,
            status: ProcessingStatus::Queued,
            text: None,
            confidence: None,
            metadata: None,
            error: None,
            processing_time_secs: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update in place and bump `updated_at`.
    pub fn apply(&mut self, update: DocumentUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(page_count) = update.page_count {
            self.page_count = Some(page_count);
        }
        if let Some(text) = update.text {
            self.text = text;
        }
        if let Some(confidence) = update.confidence {
            self.confidence = confidence;
        }
        if let Some(metadata) = update.metadata {
            self.metadata = metadata;
        }
        if let Some(error) = update.error {
            self.error = error;
        }
        if let Some(secs) = update.processing_time_secs {
            self.processing_time_secs = secs;
        }
        if let Some(progress) = update.chunk_progress {
            self.metadata
                .get_or_insert_with(DocumentMetadata::default)
                .chunk_progress = Some(progress);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a [`Document`]. `None` leaves a field untouched;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub status: Option<ProcessingStatus>,
    pub page_count: Option<usize>,
    pub text: Option<Option<String>>,
    pub confidence: Option<Option<Confidence>>,
    pub metadata: Option<Option<DocumentMetadata>>,
    pub error: Option<Option<String>>,
    pub processing_time_secs: Option<Option<f64>>,
    /// Replace only the progress snapshot inside the metadata.
    pub chunk_progress: Option<ChunkProgress>,
}

impl DocumentUpdate {
    pub fn status(status: ProcessingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(ProcessingStatus::Error),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn with_processing_time(mut self, secs: f64) -> Self {
        self.processing_time_secs = Some(Some(secs));
        self
    }
}
