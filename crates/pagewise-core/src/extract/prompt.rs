//! Instructions sent with every extraction call.
//!
//! The response structure requested here is what [`crate::parse`] reads back:
//! `--- PAGE n ---` boundaries, bracketed annotations, and a trailing summary
//! block with confidence, handwriting and notes lines.

use crate::model::PageRange;

const PRINCIPLES: &str = "\
CORE PRINCIPLES:
1. NO HALLUCINATION: never invent, infer, or add information not present in the document
2. NO SUMMARIZATION: extract the full content, not summaries
3. PRESERVE FIDELITY: keep the original spelling, punctuation, casing and formatting

OUTPUT FORMAT:
For each page, use this structure:

--- PAGE [number] ---
[All visible text exactly as it appears]

Annotate non-text elements with:
- [Handwritten: text] for handwritten content
- [Stamp: \"text\"] for stamps or seals
- [Watermark: \"text\"] for watermarks
- [Image: description] for images and logos
- [Table: markdown table] for tables
- [Redaction box present] for redacted content
- [Uncertain: possible text] for unclear content
- [Illegible: N words] for unreadable text

[Page Confidence: High/Medium/Low | Justification: reason]
";

const RULES: &str = "\
RULES:
- Extract everything visible, even if it seems redundant
- Never skip headers, footers, page numbers or watermarks
- If text is unclear, mark it as [Uncertain: ...] rather than guessing
- Keep the document's original structure and reading order
";

/// Instruction for a document sent as a single unit.
pub fn document_prompt() -> String {
    format!(
        "You are a high-fidelity document digitization system. Extract ALL text from this PDF document.\n\n\
         {PRINCIPLES}\n\
         After all pages, include:\n\n\
         === DOCUMENT EXTRACTION SUMMARY ===\n\
         TOTAL PAGES: [number]\n\
         OVERALL DOCUMENT CONFIDENCE: High/Medium/Low\n\
         DOCUMENT QUALITY: High/Medium/Low\n\
         HANDWRITING DETECTED: Yes/No\n\
         EXTRACTION NOTES: [any important notes]\n\n\
         {RULES}"
    )
}

/// Instruction for one chunk of a larger document.
///
/// Page numbers in the response must be the page numbers of the full
/// document, so the chunk's range is stated explicitly.
pub fn chunk_prompt(label: &str, range: PageRange) -> String {
    format!(
        "You are a high-fidelity document digitization system. This PDF is {label} of a larger \
         document and contains pages {start} to {end} of the original. Extract ALL text from it, \
         numbering pages as they are numbered in the original document.\n\n\
         {PRINCIPLES}\n\
         After all pages in this chunk, include:\n\n\
         === CHUNK EXTRACTION SUMMARY ===\n\
         CHUNK: {label}\n\
         PAGES IN CHUNK: {range}\n\
         TOTAL PAGES EXTRACTED: [number]\n\
         CHUNK CONFIDENCE: High/Medium/Low\n\
         CHUNK QUALITY: High/Medium/Low\n\
         HANDWRITING DETECTED: Yes/No\n\
         EXTRACTION NOTES: [any important notes]\n\n\
         {RULES}",
        start = range.start,
        end = range.end,
    )
}
