use lopdf::{Document, Object};

use pagewise_core::{BackendError, PageRange, PdfBackend, PdfInfo};

/// lopdf-based implementation of [`PdfBackend`].
///
/// Splitting works on the object graph only: each chunk is a copy of the
/// source document with every page outside its range deleted and the
/// orphaned objects pruned, so fonts and images shared by the kept pages
/// survive untouched. Nothing is rendered or re-encoded.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfBackend;

impl LopdfBackend {
    pub fn new() -> Self {
        Self
    }
}

fn load(bytes: &[u8]) -> Result<Document, BackendError> {
    let doc = Document::load_mem(bytes).map_err(|e| BackendError::Open(e.to_string()))?;
    if doc.is_encrypted() {
        return Err(BackendError::Open("document is encrypted".into()));
    }
    Ok(doc)
}

/// Read a text entry of the trailer's Info dictionary.
fn info_field(doc: &Document, key: &[u8]) -> Option<String> {
    let info = doc.trailer.get(b"Info").ok()?;
    let dict = match info {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok()?,
        other => other.as_dict().ok()?,
    };
    let value = dict.get(key).ok()?.as_str().ok()?;
    let text = String::from_utf8_lossy(value).trim().to_string();
    (!text.is_empty()).then_some(text)
}

impl PdfBackend for LopdfBackend {
    fn inspect(&self, bytes: &[u8]) -> Result<PdfInfo, BackendError> {
        let doc = load(bytes)?;
        Ok(PdfInfo {
            page_count: doc.get_pages().len(),
            byte_size: bytes.len() as u64,
            title: info_field(&doc, b"Title"),
            author: info_field(&doc, b"Author"),
        })
    }

    fn split(&self, bytes: &[u8], ranges: &[PageRange]) -> Result<Vec<Vec<u8>>, BackendError> {
        let source = load(bytes)?;
        let page_count = source.get_pages().len();
        let mut payloads = Vec::with_capacity(ranges.len());

        for range in ranges {
            if range.is_empty() || range.start == 0 || range.end > page_count {
                return Err(BackendError::Split(format!(
                    "page range {range} outside 1-{page_count}"
                )));
            }
            let outside: Vec<u32> = (1..=page_count)
                .filter(|p| *p < range.start || *p > range.end)
                .map(|p| p as u32)
                .collect();

            let mut chunk = source.clone();
            chunk.delete_pages(&outside);
            chunk.prune_objects();
            chunk.renumber_objects();

            let kept = chunk.get_pages().len();
            if kept != range.len() {
                return Err(BackendError::Split(format!(
                    "range {range} kept {kept} pages, expected {}",
                    range.len()
                )));
            }

            let mut buf = Vec::new();
            chunk
                .save_to(&mut buf)
                .map_err(|e| BackendError::Split(format!("range {range}: {e}")))?;
            tracing::debug!(range = %range, bytes = buf.len(), "split chunk");
            payloads.push(buf);
        }
        Ok(payloads)
    }
}
