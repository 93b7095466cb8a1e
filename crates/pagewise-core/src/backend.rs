use thiserror::Error;

use crate::model::PageRange;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to open PDF: {0}")]
    Open(String),
    #[error("failed to split PDF: {0}")]
    Split(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Page count and descriptive fields read from a PDF.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdfInfo {
    pub page_count: usize,
    pub byte_size: u64,
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Trait for byte-level PDF handling.
///
/// Implementors read the page structure of a document and cut it into
/// standalone payloads; what happens to those payloads lives in
/// [`crate::planner`] and [`crate::worker`].
pub trait PdfBackend: Send + Sync {
    /// Read the page count and document info without rendering anything.
    fn inspect(&self, bytes: &[u8]) -> Result<PdfInfo, BackendError>;

    /// Produce one standalone PDF per range, in the order given.
    fn split(&self, bytes: &[u8], ranges: &[PageRange]) -> Result<Vec<Vec<u8>>, BackendError>;
}
