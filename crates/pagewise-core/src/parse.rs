//! Quality signals read back out of an extraction response.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::Confidence;

static PAGE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"--- PAGE \d+ ---").unwrap());
static HANDWRITTEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\[Handwritten:").unwrap());
static HANDWRITING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*HANDWRITING DETECTED:\s*Yes\b").unwrap());
static CONFIDENCE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:OVERALL DOCUMENT|CHUNK) CONFIDENCE:\s*(High|Medium|Low)").unwrap()
});
static NOTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)EXTRACTION NOTES:[ \t]*(.+)").unwrap());
static UNCERTAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[Uncertain:").unwrap());
static ILLEGIBLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[Illegible:").unwrap());

/// Signals parsed from one extraction response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub page_count: usize,
    pub has_handwriting: bool,
    pub confidence: Confidence,
    pub notes: Option<String>,
}

pub fn parse_extraction(text: &str) -> ExtractionSummary {
    let notes = NOTES
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    ExtractionSummary {
        page_count: PAGE_MARKER.find_iter(text).count(),
        has_handwriting: HANDWRITTEN.is_match(text) || HANDWRITING_LINE.is_match(text),
        confidence: confidence_label(text),
        notes,
    }
}

/// Explicit summary label, else a heuristic on uncertainty markers.
pub fn confidence_label(text: &str) -> Confidence {
    if let Some(label) = CONFIDENCE_LABEL
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| Confidence::parse(m.as_str()))
    {
        return label;
    }

    let markers = UNCERTAIN.find_iter(text).count() + ILLEGIBLE.find_iter(text).count();
    if markers > 10 {
        Confidence::Low
    } else if markers > 3 {
        Confidence::Medium
    } else {
        Confidence::High
    }
}
