//! Extraction capability: the remote service that turns PDF bytes into text.

pub mod gemini;
pub mod mock;
pub mod prompt;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::model::PageRange;
use crate::retry::FailureClass;

pub use gemini::GeminiBackend;
pub use mock::{MockExtractor, MockResponse};

/// HTTP status codes treated as transient server failures.
pub const TRANSIENT_SERVER_CODES: [u16; 5] = [499, 500, 502, 503, 504];

/// Typed failure of one extraction call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("extraction timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("rate limited (429){}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },
    #[error("{0}")]
    Other(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {:.1}s", d.as_secs_f64()),
        None => String::new(),
    }
}

impl ExtractionError {
    pub fn class(&self) -> FailureClass {
        match self {
            ExtractionError::Timeout(_) => FailureClass::Timeout,
            ExtractionError::RateLimited { .. } => FailureClass::RateLimited,
            ExtractionError::Server { code, .. } if TRANSIENT_SERVER_CODES.contains(code) => {
                FailureClass::Transient
            }
            ExtractionError::Server { .. } | ExtractionError::Other(_) => FailureClass::Fatal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExtractionError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// One call's worth of input for the extraction service.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub payload: Arc<[u8]>,
    /// Page range of the payload within its document; `None` for a whole document.
    pub pages: Option<PageRange>,
    /// Human-readable unit name, e.g. `"chunk 2 of 3"`.
    pub label: String,
    pub prompt: String,
}

/// A remote extraction service.
pub trait ExtractionBackend: Send + Sync {
    /// Short service name used in logs.
    fn name(&self) -> &str;

    /// Extract text from the request payload.
    fn extract<'a>(
        &'a self,
        request: &'a ExtractionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExtractionError>> + Send + 'a>>;
}
