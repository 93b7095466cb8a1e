use std::io::Write;

use owo_colors::OwoColorize;
use pagewise_core::{
    ChunkPlanner, Document, DocumentOutcome, PageRange, PdfInfo, ProcessingStatus,
};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn status_label(status: ProcessingStatus, color: ColorMode) -> String {
    let label = status.as_str().to_uppercase();
    if !color.enabled() {
        return label;
    }
    match status {
        ProcessingStatus::Completed => label.green().to_string(),
        ProcessingStatus::PartialError => label.yellow().to_string(),
        ProcessingStatus::Error => label.red().to_string(),
        _ => label.cyan().to_string(),
    }
}

fn join_ranges(ranges: &[PageRange]) -> String {
    ranges
        .iter()
        .map(PageRange::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn print_submitted(w: &mut dyn Write, document: &Document, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(
            w,
            "Submitted {} as {}",
            document.filename.bold(),
            document.id.dimmed()
        )?;
    } else {
        writeln!(w, "Submitted {} as {}", document.filename, document.id)?;
    }
    Ok(())
}

/// Print how a file would be split, without processing it.
pub fn print_plan(
    w: &mut dyn Write,
    file_name: &str,
    info: &PdfInfo,
    planner: &ChunkPlanner,
    color: ColorMode,
) -> std::io::Result<()> {
    let size_mb = info.byte_size as f64 / (1024.0 * 1024.0);
    if color.enabled() {
        writeln!(w, "{} {}", "PLAN:".bold().cyan(), file_name.bold())?;
    } else {
        writeln!(w, "PLAN: {}", file_name)?;
    }
    writeln!(w, "  Pages:   {}", info.page_count)?;
    writeln!(w, "  Size:    {:.2} MB", size_mb)?;
    if let Some(ref title) = info.title {
        writeln!(w, "  Title:   {}", title)?;
    }
    if let Some(ref author) = info.author {
        writeln!(w, "  Author:  {}", author)?;
    }
    writeln!(w)?;

    if !planner.needs_chunking(info.page_count, info.byte_size) {
        writeln!(
            w,
            "Single request (at most {} pages and {:.1} MB)",
            planner.page_threshold(),
            planner.size_threshold_mb()
        )?;
        return Ok(());
    }

    let ranges = planner.page_ranges(info.page_count);
    writeln!(
        w,
        "Chunked: {} chunks of up to {} pages",
        ranges.len(),
        planner.chunk_size()
    )?;
    for (i, range) in ranges.iter().enumerate() {
        if color.enabled() {
            writeln!(w, "  {} pages {}", format!("[{}]", i + 1).yellow(), range)?;
        } else {
            writeln!(w, "  [{}] pages {}", i + 1, range)?;
        }
    }
    Ok(())
}

/// Print the result of one processing run.
pub fn print_outcome(
    w: &mut dyn Write,
    outcome: &DocumentOutcome,
    color: ColorMode,
) -> std::io::Result<()> {
    let document = &outcome.document;
    let sep = "=".repeat(60);
    writeln!(w)?;
    if color.enabled() {
        writeln!(w, "{}", sep.bold())?;
        writeln!(w, "{}", "SUMMARY".bold())?;
        writeln!(w, "{}", sep.bold())?;
    } else {
        writeln!(w, "{}", sep)?;
        writeln!(w, "SUMMARY")?;
        writeln!(w, "{}", sep)?;
    }
    writeln!(w, "  Document:   {}", document.id)?;
    writeln!(w, "  Status:     {}", status_label(document.status, color))?;
    if let Some(pages) = document.page_count {
        writeln!(w, "  Pages:      {}", pages)?;
    }
    if outcome.chunks > 1 {
        writeln!(
            w,
            "  Chunks:     {} ({} failed)",
            outcome.chunks,
            outcome.failed_ranges.len()
        )?;
    }
    if let Some(confidence) = document.confidence {
        writeln!(w, "  Confidence: {}", confidence)?;
    }
    if let Some(ref text) = document.text {
        writeln!(w, "  Characters: {}", text.chars().count())?;
    }
    writeln!(w, "  Time:       {:.1}s", outcome.elapsed.as_secs_f64())?;

    if !outcome.failed_ranges.is_empty() {
        let line = format!("Failed pages: {}", join_ranges(&outcome.failed_ranges));
        if color.enabled() {
            writeln!(w, "  {}", line.yellow())?;
        } else {
            writeln!(w, "  {}", line)?;
        }
    }
    if let Some(ref error) = document.error {
        if color.enabled() {
            writeln!(w, "  {} {}", "Error:".red(), error)?;
        } else {
            writeln!(w, "  Error: {}", error)?;
        }
    }
    Ok(())
}

/// One line per stored document.
pub fn print_document_list(
    w: &mut dyn Write,
    documents: &[Document],
    color: ColorMode,
) -> std::io::Result<()> {
    if documents.is_empty() {
        writeln!(w, "No documents.")?;
        return Ok(());
    }
    for document in documents {
        let pages = document
            .page_count
            .map(|p| format!("{p} pages"))
            .unwrap_or_else(|| "? pages".to_string());
        let id = if color.enabled() {
            document.id.dimmed().to_string()
        } else {
            document.id.to_string()
        };
        writeln!(
            w,
            "{}  {:<14} {:>10}  {}  {}",
            id,
            status_label(document.status, color),
            pages,
            document.created_at.format("%Y-%m-%d %H:%M"),
            document.filename
        )?;
    }
    writeln!(w)?;
    writeln!(w, "Total: {} documents", documents.len())?;
    Ok(())
}

/// Full record of one document, without its text.
pub fn print_document(
    w: &mut dyn Write,
    document: &Document,
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{}", document.filename.bold())?;
    } else {
        writeln!(w, "{}", document.filename)?;
    }
    writeln!(w, "  ID:         {}", document.id)?;
    writeln!(w, "  Status:     {}", status_label(document.status, color))?;
    writeln!(w, "  Size:       {} bytes", document.byte_size)?;
    if let Some(pages) = document.page_count {
        writeln!(w, "  Pages:      {}", pages)?;
    }
    if let Some(confidence) = document.confidence {
        writeln!(w, "  Confidence: {}", confidence)?;
    }
    if let Some(secs) = document.processing_time_secs {
        writeln!(w, "  Time:       {:.1}s", secs)?;
    }
    writeln!(w, "  Created:    {}", document.created_at.to_rfc3339())?;
    writeln!(w, "  Updated:    {}", document.updated_at.to_rfc3339())?;

    if let Some(ref metadata) = document.metadata {
        writeln!(w, "  Handwriting: {}", if metadata.has_handwriting { "yes" } else { "no" })?;
        writeln!(w, "  Quality:    {}", metadata.quality)?;
        if metadata.is_chunked {
            let size = metadata
                .chunk_size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "?".into());
            writeln!(w, "  Chunk size: {} pages", size)?;
        }
        if let Some(ref progress) = metadata.chunk_progress {
            writeln!(
                w,
                "  Chunks:     {}/{} completed, {} failed, {} processing",
                progress.completed, progress.total, progress.failed, progress.processing
            )?;
        }
        if let Some(ref notes) = metadata.extraction_notes {
            if color.enabled() {
                writeln!(w, "  Notes:      {}", notes.dimmed())?;
            } else {
                writeln!(w, "  Notes:      {}", notes)?;
            }
        }
    }
    if let Some(ref error) = document.error {
        if color.enabled() {
            writeln!(w, "  {} {}", "Error:".red(), error)?;
        } else {
            writeln!(w, "  Error: {}", error)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewise_core::DocumentId;

    fn render(f: impl FnOnce(&mut Vec<u8>) -> std::io::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn plan_lists_every_range() {
        let planner = ChunkPlanner::new(50, 50, 5.0);
        let info = PdfInfo {
            page_count: 120,
            byte_size: 1024,
            ..PdfInfo::default()
        };
        let out = render(|w| print_plan(w, "big.pdf", &info, &planner, ColorMode(false)));
        assert!(out.contains("Chunked: 3 chunks of up to 50 pages"));
        assert!(out.contains("[3] pages 101-120"));
    }

    #[test]
    fn plan_reports_single_request() {
        let planner = ChunkPlanner::new(20, 50, 5.0);
        let info = PdfInfo {
            page_count: 12,
            byte_size: 2048,
            ..PdfInfo::default()
        };
        let out = render(|w| print_plan(w, "memo.pdf", &info, &planner, ColorMode(false)));
        assert!(out.contains("Single request"));
        assert!(!out.contains("Chunked"));
    }

    #[test]
    fn empty_list_says_so() {
        let out = render(|w| print_document_list(w, &[], ColorMode(false)));
        assert_eq!(out, "No documents.\n");
    }

    #[test]
    fn document_shows_error() {
        let mut document = Document::queued(
            DocumentId::from("doc-1"),
            "scan.pdf",
            "loc".into(),
            10,
        );
        document.status = ProcessingStatus::Error;
        document.error = Some("All chunks failed to process.".into());
        let out = render(|w| print_document(w, &document, ColorMode(false)));
        assert!(out.contains("Status:     ERROR"));
        assert!(out.contains("Error: All chunks failed to process."));
    }
}
