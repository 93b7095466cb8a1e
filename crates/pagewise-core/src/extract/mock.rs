//! Scripted extraction backend for tests and dry runs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ExtractionBackend, ExtractionError, ExtractionRequest};
use crate::model::PageRange;

/// A configurable mock response for [`MockExtractor`].
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this text.
    Text(String),
    /// Return a generated body with one page marker per page of the request
    /// and a summary block carrying `confidence`.
    Pages { confidence: &'static str },
    /// Fail with this error.
    Fail(ExtractionError),
    /// Never answer; only the caller's timeout ends the call.
    Hang,
}

/// A hand-rolled mock implementing [`ExtractionBackend`].
///
/// Supports:
/// - A fixed response, **or** a global sequence (one per call, last repeated).
/// - Per-page-range scripts, which take precedence over the global sequence.
/// - Optional per-call latency.
/// - Call counting, per range and overall, plus peak in-flight calls.
pub struct MockExtractor {
    responses: Mutex<Vec<MockResponse>>,
    fallback: MockResponse,
    by_range: Mutex<HashMap<PageRange, Vec<MockResponse>>>,
    delay: Option<Duration>,
    delays_by_range: HashMap<PageRange, Duration>,
    call_count: AtomicUsize,
    calls_by_range: Mutex<HashMap<Option<PageRange>, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockExtractor {
    /// Create a mock that always returns `response`.
    pub fn new(response: MockResponse) -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fallback: response,
            by_range: Mutex::new(HashMap::new()),
            delay: None,
            delays_by_range: HashMap::new(),
            call_count: AtomicUsize::new(0),
            calls_by_range: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Create a mock that generates page-marked text with high confidence.
    pub fn pages() -> Self {
        Self::new(MockResponse::Pages { confidence: "High" })
    }

    /// Create a mock that returns responses in order, repeating the last one.
    pub fn with_sequence(mut responses: Vec<MockResponse>) -> Self {
        responses.reverse();
        let fallback = responses
            .first()
            .cloned()
            .unwrap_or(MockResponse::Pages { confidence: "High" });
        let mock = Self::new(fallback);
        *mock.responses.lock().unwrap_or_else(|e| e.into_inner()) = responses;
        mock
    }

    /// Script the responses for one page range, repeating the last one.
    pub fn script_range(self, range: PageRange, mut responses: Vec<MockResponse>) -> Self {
        responses.reverse();
        self.by_range
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(range, responses);
        self
    }

    /// Set simulated latency per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set simulated latency for one page range, overriding the default.
    pub fn with_range_delay(mut self, range: PageRange, delay: Duration) -> Self {
        self.delays_by_range.insert(range, delay);
        self
    }

    /// How many times `extract()` has been called.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// How many calls targeted `range` (`None` for whole-document calls).
    pub fn calls_for(&self, range: Option<PageRange>) -> usize {
        self.calls_by_range
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&range)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of concurrently running calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_response(&self, range: Option<PageRange>) -> MockResponse {
        if let Some(range) = range {
            let mut scripts = self.by_range.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(seq) = scripts.get_mut(&range) {
                if seq.len() > 1 {
                    if let Some(resp) = seq.pop() {
                        return resp;
                    }
                } else if let Some(last) = seq.first() {
                    return last.clone();
                }
            }
        }
        let mut seq = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        seq.pop().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Page-marked body for `range` with a summary block.
pub fn render_pages(range: PageRange, confidence: &str) -> String {
    let mut out = String::new();
    for page in range.start..=range.end {
        out.push_str(&format!("--- PAGE {page} ---\nText of page {page}.\n\n"));
    }
    out.push_str(&format!(
        "=== EXTRACTION SUMMARY ===\nTOTAL PAGES: {}\nCHUNK CONFIDENCE: {confidence}\n\
         HANDWRITING DETECTED: No\nEXTRACTION NOTES: pages {range}\n",
        range.len()
    ));
    out
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ExtractionBackend for MockExtractor {
    fn name(&self) -> &str {
        "mock"
    }

    fn extract<'a>(
        &'a self,
        request: &'a ExtractionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExtractionError>> + Send + 'a>> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_range
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(request.pages)
            .or_insert(0) += 1;
        let response = self.next_response(request.pages);
        let delay = request
            .pages
            .and_then(|r| self.delays_by_range.get(&r).copied())
            .or(self.delay);

        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }

            match response {
                MockResponse::Text(text) => Ok(text),
                MockResponse::Pages { confidence } => {
                    let range = request.pages.unwrap_or(PageRange::new(1, 1));
                    Ok(render_pages(range, confidence))
                }
                MockResponse::Fail(err) => Err(err),
                MockResponse::Hang => {
                    std::future::pending::<()>().await;
                    Err(ExtractionError::Other("unreachable".into()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(range: Option<PageRange>) -> ExtractionRequest {
        ExtractionRequest {
            payload: Arc::from(&b"%PDF"[..]),
            pages: range,
            label: "test".into(),
            prompt: String::new(),
        }
    }

    #[tokio::test]
    async fn sequence_then_repeat_last() {
        let mock = MockExtractor::with_sequence(vec![
            MockResponse::Fail(ExtractionError::Other("first".into())),
            MockResponse::Text("ok".into()),
        ]);
        let req = request(None);
        assert!(mock.extract(&req).await.is_err());
        assert_eq!(mock.extract(&req).await.unwrap(), "ok");
        assert_eq!(mock.extract(&req).await.unwrap(), "ok");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn range_scripts_take_precedence() {
        let bad = PageRange::new(51, 100);
        let mock = MockExtractor::pages().script_range(
            bad,
            vec![MockResponse::Fail(ExtractionError::Other("nope".into()))],
        );
        let good = request(Some(PageRange::new(1, 2)));
        let text = mock.extract(&good).await.unwrap();
        assert!(text.contains("--- PAGE 2 ---"));
        assert!(mock.extract(&request(Some(bad))).await.is_err());
        assert!(mock.extract(&request(Some(bad))).await.is_err());
        assert_eq!(mock.calls_for(Some(bad)), 2);
    }

    #[test]
    fn rendered_pages_parse_back() {
        let text = render_pages(PageRange::new(3, 5), "Medium");
        let summary = crate::parse::parse_extraction(&text);
        assert_eq!(summary.page_count, 3);
        assert_eq!(summary.confidence, crate::model::Confidence::Medium);
        assert!(!summary.has_handwriting);
    }
}
