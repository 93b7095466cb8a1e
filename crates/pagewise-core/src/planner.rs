//! Split decision and page-range partitioning.

use thiserror::Error;

use crate::backend::{BackendError, PdfBackend, PdfInfo};
use crate::model::PageRange;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("malformed document: {0}")]
    Malformed(String),
    #[error("document has no pages")]
    Empty,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One page-range slice ready for extraction.
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    /// 1-based chunk index.
    pub index: usize,
    pub range: PageRange,
    pub payload: Vec<u8>,
}

/// How a document will be processed.
#[derive(Debug, Clone)]
pub enum Plan {
    Single { info: PdfInfo },
    Chunked {
        info: PdfInfo,
        chunks: Vec<PlannedChunk>,
    },
}

impl Plan {
    pub fn info(&self) -> &PdfInfo {
        match self {
            Plan::Single { info } | Plan::Chunked { info, .. } => info,
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, Plan::Chunked { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkPlanner {
    chunk_size: usize,
    page_threshold: usize,
    size_threshold_mb: f64,
}

impl Default for ChunkPlanner {
    fn default() -> Self {
        Self::new(20, 50, 5.0)
    }
}

impl ChunkPlanner {
    /// A chunk size of zero is treated as one page per chunk.
    pub fn new(chunk_size: usize, page_threshold: usize, size_threshold_mb: f64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            page_threshold,
            size_threshold_mb,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn page_threshold(&self) -> usize {
        self.page_threshold
    }

    pub fn size_threshold_mb(&self) -> f64 {
        self.size_threshold_mb
    }

    /// Chunk if either threshold is strictly exceeded.
    pub fn needs_chunking(&self, page_count: usize, byte_size: u64) -> bool {
        let size_mb = byte_size as f64 / BYTES_PER_MB;
        page_count > self.page_threshold || size_mb > self.size_threshold_mb
    }

    pub fn chunk_count(&self, page_count: usize) -> usize {
        page_count.div_ceil(self.chunk_size)
    }

    /// Contiguous windows of `chunk_size` pages covering `[1, page_count]`.
    pub fn page_ranges(&self, page_count: usize) -> Vec<PageRange> {
        (0..page_count)
            .step_by(self.chunk_size)
            .map(|start| PageRange::new(start + 1, (start + self.chunk_size).min(page_count)))
            .collect()
    }

    /// Inspect `bytes` and, if required, split them into chunk payloads.
    ///
    /// Either the full plan is returned or an error; never a partial plan.
    pub fn plan(&self, bytes: &[u8], backend: &dyn PdfBackend) -> Result<Plan, PlanError> {
        let mut info = backend.inspect(bytes)?;
        if info.page_count == 0 {
            return Err(PlanError::Empty);
        }
        if info.byte_size == 0 {
            info.byte_size = bytes.len() as u64;
        }

        if !self.needs_chunking(info.page_count, info.byte_size) {
            tracing::debug!(pages = info.page_count, bytes = info.byte_size, "single-unit plan");
            return Ok(Plan::Single { info });
        }

        let ranges = self.page_ranges(info.page_count);
        let payloads = backend.split(bytes, &ranges)?;
        if payloads.len() != ranges.len() {
            return Err(PlanError::Malformed(format!(
                "backend produced {} payloads for {} page ranges",
                payloads.len(),
                ranges.len()
            )));
        }

        let chunks: Vec<PlannedChunk> = ranges
            .into_iter()
            .zip(payloads)
            .enumerate()
            .map(|(i, (range, payload))| PlannedChunk {
                index: i + 1,
                range,
                payload,
            })
            .collect();

        tracing::info!(
            pages = info.page_count,
            bytes = info.byte_size,
            chunks = chunks.len(),
            chunk_size = self.chunk_size,
            "chunked plan"
        );
        Ok(Plan::Chunked { info, chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePdf {
        pages: usize,
        drop_one: bool,
    }

    impl PdfBackend for FakePdf {
        fn inspect(&self, bytes: &[u8]) -> Result<PdfInfo, BackendError> {
            if bytes.starts_with(b"junk") {
                return Err(BackendError::Open("no header".into()));
            }
            Ok(PdfInfo {
                page_count: self.pages,
                byte_size: bytes.len() as u64,
                ..PdfInfo::default()
            })
        }

        fn split(&self, _bytes: &[u8], ranges: &[PageRange]) -> Result<Vec<Vec<u8>>, BackendError> {
            let mut out: Vec<Vec<u8>> = ranges
                .iter()
                .map(|r| r.to_string().into_bytes())
                .collect();
            if self.drop_one {
                out.pop();
            }
            Ok(out)
        }
    }

    #[test]
    fn ranges_partition_all_pages() {
        for size in 1..=7 {
            let planner = ChunkPlanner::new(size, 0, 0.0);
            for pages in 1..=40 {
                let ranges = planner.page_ranges(pages);
                assert_eq!(ranges.len(), pages.div_ceil(size));
                assert_eq!(ranges.len(), planner.chunk_count(pages));
                assert_eq!(ranges[0].start, 1);
                assert_eq!(ranges.last().map(|r| r.end), Some(pages));
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end + 1, pair[1].start);
                }
                let covered: usize = ranges.iter().map(PageRange::len).sum();
                assert_eq!(covered, pages);
            }
        }
    }

    #[test]
    fn last_chunk_may_be_short() {
        let ranges = ChunkPlanner::new(20, 50, 5.0).page_ranges(45);
        assert_eq!(
            ranges,
            vec![
                PageRange::new(1, 20),
                PageRange::new(21, 40),
                PageRange::new(41, 45)
            ]
        );
    }

    #[test]
    fn thresholds_are_strict() {
        let planner = ChunkPlanner::new(20, 50, 5.0);
        assert!(!planner.needs_chunking(50, 1024));
        assert!(planner.needs_chunking(51, 1024));
        let five_mb = 5 * 1024 * 1024;
        assert!(!planner.needs_chunking(3, five_mb));
        assert!(planner.needs_chunking(3, five_mb + 1));
    }

    #[test]
    fn zero_chunk_size_is_clamped() {
        assert_eq!(ChunkPlanner::new(0, 1, 1.0).chunk_size(), 1);
    }

    #[test]
    fn small_document_is_single_unit() {
        let plan = ChunkPlanner::default()
            .plan(b"%PDF small", &FakePdf { pages: 3, drop_one: false })
            .unwrap();
        assert!(!plan.is_chunked());
        assert_eq!(plan.info().page_count, 3);
    }

    #[test]
    fn large_document_gets_payload_per_range() {
        let plan = ChunkPlanner::new(50, 50, 5.0)
            .plan(b"%PDF big", &FakePdf { pages: 150, drop_one: false })
            .unwrap();
        let Plan::Chunked { chunks, .. } = plan else {
            panic!("expected chunked plan");
        };
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].index, 2);
        assert_eq!(chunks[1].range, PageRange::new(51, 100));
        assert_eq!(chunks[1].payload, b"51-100");
    }

    #[test]
    fn malformed_input_is_fatal() {
        let err = ChunkPlanner::default()
            .plan(b"junk", &FakePdf { pages: 3, drop_one: false })
            .unwrap_err();
        assert!(matches!(err, PlanError::Backend(BackendError::Open(_))));

        let err = ChunkPlanner::default()
            .plan(b"%PDF", &FakePdf { pages: 0, drop_one: false })
            .unwrap_err();
        assert!(matches!(err, PlanError::Empty));
    }

    #[test]
    fn payload_count_mismatch_is_rejected() {
        let err = ChunkPlanner::new(10, 5, 5.0)
            .plan(b"%PDF", &FakePdf { pages: 30, drop_one: true })
            .unwrap_err();
        assert!(matches!(err, PlanError::Malformed(_)));
    }
}
