//! Fan-in of chunk outcomes into one document result.

use thiserror::Error;

use crate::model::{Confidence, PageRange, ProcessingStatus};
use crate::worker::ChunkOutcome;

/// Separator placed between the text of consecutive successful chunks.
pub const CHUNK_SEPARATOR: &str = "\n\n";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("no chunks to aggregate")]
    Empty,
    #[error("chunk {index} is outside 1..={total}")]
    OutOfRange { index: usize, total: usize },
    #[error("chunk {0} reported more than once")]
    Duplicate(usize),
    #[error("chunk {0} never reported")]
    Missing(usize),
}

/// Combined result of a chunked document.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub status: ProcessingStatus,
    /// Successful chunks' text in index order; empty when every chunk failed.
    pub text: String,
    pub confidence: Confidence,
    pub has_handwriting: bool,
    /// Failure summary; `None` when every chunk succeeded.
    pub error: Option<String>,
    pub notes: String,
    /// Pages reported by successful chunks.
    pub page_count: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_ranges: Vec<PageRange>,
}

/// High if more than half of the labels are high, else medium if more than
/// half are high or medium, else low. No labels means low.
pub fn overall_confidence(labels: &[Confidence]) -> Confidence {
    let n = labels.len();
    if n == 0 {
        return Confidence::Low;
    }
    let high = labels.iter().filter(|c| **c == Confidence::High).count();
    let medium = labels.iter().filter(|c| **c == Confidence::Medium).count();
    if high * 2 > n {
        Confidence::High
    } else if (high + medium) * 2 > n {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

fn format_ranges(ranges: &[PageRange]) -> String {
    ranges
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Combine the outcomes of a document split into `total` chunks.
///
/// Outcomes may arrive in any order; they must cover indices `1..=total`
/// exactly once.
pub fn aggregate(
    total: usize,
    mut outcomes: Vec<ChunkOutcome>,
) -> Result<Aggregate, AggregationError> {
    if total == 0 {
        return Err(AggregationError::Empty);
    }
    outcomes.sort_by_key(|o| o.index);

    let mut expected = 1;
    for outcome in &outcomes {
        if outcome.index == 0 || outcome.index > total {
            return Err(AggregationError::OutOfRange {
                index: outcome.index,
                total,
            });
        }
        if outcome.index < expected {
            return Err(AggregationError::Duplicate(outcome.index));
        }
        if outcome.index > expected {
            return Err(AggregationError::Missing(expected));
        }
        expected += 1;
    }
    if expected <= total {
        return Err(AggregationError::Missing(expected));
    }

    let mut texts = Vec::new();
    let mut labels = Vec::new();
    let mut has_handwriting = false;
    let mut page_count = 0;
    let mut failed_ranges = Vec::new();

    for outcome in &outcomes {
        match &outcome.result {
            Ok(extraction) => {
                texts.push(extraction.text.as_str());
                labels.push(extraction.summary.confidence);
                has_handwriting |= extraction.summary.has_handwriting;
                page_count += extraction.summary.page_count;
            }
            Err(_) => failed_ranges.push(outcome.range),
        }
    }

    let succeeded = texts.len();
    let failed = failed_ranges.len();
    let (status, error) = if failed == 0 {
        (ProcessingStatus::Completed, None)
    } else if succeeded == 0 {
        (
            ProcessingStatus::Error,
            Some(format!(
                "All chunks failed to process. Failed chunks (pages): {}",
                format_ranges(&failed_ranges)
            )),
        )
    } else {
        (
            ProcessingStatus::PartialError,
            Some(format!(
                "Processed {succeeded}/{total} chunks successfully. Failed chunks (pages): {}",
                format_ranges(&failed_ranges)
            )),
        )
    };

    Ok(Aggregate {
        status,
        text: texts.join(CHUNK_SEPARATOR),
        confidence: overall_confidence(&labels),
        has_handwriting,
        error,
        notes: format!("Processed in {total} chunks. Successful: {succeeded}, Failed: {failed}"),
        page_count,
        total,
        succeeded,
        failed,
        failed_ranges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractionError;
    use crate::parse::ExtractionSummary;
    use crate::worker::ChunkExtraction;
    use crate::model::Confidence::{High, Low, Medium};

    fn ok(index: usize, range: (usize, usize), text: &str, confidence: Confidence) -> ChunkOutcome {
        ChunkOutcome {
            index,
            range: PageRange::new(range.0, range.1),
            attempts: 1,
            result: Ok(ChunkExtraction {
                text: text.to_string(),
                summary: ExtractionSummary {
                    page_count: range.1 + 1 - range.0,
                    has_handwriting: false,
                    confidence,
                    notes: None,
                },
            }),
        }
    }

    fn failed(index: usize, range: (usize, usize)) -> ChunkOutcome {
        ChunkOutcome {
            index,
            range: PageRange::new(range.0, range.1),
            attempts: 5,
            result: Err(ExtractionError::Timeout(std::time::Duration::from_secs(120))),
        }
    }

    #[test]
    fn confidence_majority_rules() {
        assert_eq!(overall_confidence(&[High, High, Medium, Low]), Medium);
        assert_eq!(overall_confidence(&[High, High, High, Low]), High);
        assert_eq!(overall_confidence(&[Low, Low]), Low);
        assert_eq!(overall_confidence(&[Medium, Low, Low]), Low);
        assert_eq!(overall_confidence(&[]), Low);
    }

    #[test]
    fn all_succeed_is_completed() {
        let agg = aggregate(
            2,
            vec![ok(1, (1, 20), "one", High), ok(2, (21, 30), "two", High)],
        )
        .unwrap();
        assert_eq!(agg.status, ProcessingStatus::Completed);
        assert_eq!(agg.text, "one\n\ntwo");
        assert_eq!(agg.error, None);
        assert_eq!(agg.page_count, 30);
        assert_eq!(agg.notes, "Processed in 2 chunks. Successful: 2, Failed: 0");
    }

    #[test]
    fn text_is_independent_of_completion_order() {
        let in_order = aggregate(
            3,
            vec![
                ok(1, (1, 10), "a", High),
                ok(2, (11, 20), "b", Medium),
                ok(3, (21, 25), "c", Low),
            ],
        )
        .unwrap();
        let shuffled = aggregate(
            3,
            vec![
                ok(3, (21, 25), "c", Low),
                ok(1, (1, 10), "a", High),
                ok(2, (11, 20), "b", Medium),
            ],
        )
        .unwrap();
        assert_eq!(in_order, shuffled);
    }

    #[test]
    fn middle_failure_is_partial_error() {
        let agg = aggregate(
            3,
            vec![
                ok(3, (101, 150), "third", High),
                failed(2, (51, 100)),
                ok(1, (1, 50), "first", High),
            ],
        )
        .unwrap();
        assert_eq!(agg.status, ProcessingStatus::PartialError);
        assert_eq!(agg.text, "first\n\nthird");
        assert_eq!(
            agg.error.as_deref(),
            Some("Processed 2/3 chunks successfully. Failed chunks (pages): 51-100")
        );
        assert_eq!(agg.failed_ranges, vec![PageRange::new(51, 100)]);
        assert_eq!(agg.confidence, High);
    }

    #[test]
    fn all_failed_is_error_without_text() {
        let agg = aggregate(2, vec![failed(1, (1, 10)), failed(2, (11, 12))]).unwrap();
        assert_eq!(agg.status, ProcessingStatus::Error);
        assert!(agg.text.is_empty());
        assert_eq!(agg.confidence, Low);
        assert_eq!(
            agg.error.as_deref(),
            Some("All chunks failed to process. Failed chunks (pages): 1-10, 11-12")
        );
    }

    #[test]
    fn handwriting_is_or_of_successes() {
        let mut hand = ok(2, (2, 2), "b", High);
        if let Ok(ext) = &mut hand.result {
            ext.summary.has_handwriting = true;
        }
        let agg = aggregate(2, vec![ok(1, (1, 1), "a", High), hand]).unwrap();
        assert!(agg.has_handwriting);
    }

    #[test]
    fn inconsistent_outcome_sets_are_rejected() {
        assert_eq!(aggregate(0, vec![]), Err(AggregationError::Empty));
        assert_eq!(
            aggregate(2, vec![ok(1, (1, 1), "a", High)]),
            Err(AggregationError::Missing(2))
        );
        assert_eq!(
            aggregate(
                2,
                vec![
                    ok(1, (1, 1), "a", High),
                    ok(1, (1, 1), "a", High),
                    ok(2, (2, 2), "b", High)
                ]
            ),
            Err(AggregationError::Duplicate(1))
        );
        assert_eq!(
            aggregate(1, vec![ok(4, (1, 1), "a", High)]),
            Err(AggregationError::OutOfRange { index: 4, total: 1 })
        );
        assert_eq!(
            aggregate(3, vec![ok(1, (1, 1), "a", High), ok(3, (3, 3), "c", High)]),
            Err(AggregationError::Missing(2))
        );
    }
}
