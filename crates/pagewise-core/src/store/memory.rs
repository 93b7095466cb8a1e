use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{DocumentStore, StoreError};
use crate::model::{Document, DocumentId, DocumentUpdate};

/// In-process record store. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryDocumentStore {
    /// Records with their insertion sequence, used to break timestamp ties.
    records: DashMap<DocumentId, (u64, Document)>,
    next_seq: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn create(&self, document: &Document) -> Result<(), StoreError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        match self.records.entry(document.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(document.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert((seq, document.clone()));
                Ok(())
            }
        }
    }

    fn get(&self, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.records.get(id).map(|r| r.value().1.clone()))
    }

    fn update(&self, id: &DocumentId, update: DocumentUpdate) -> Result<Document, StoreError> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.1.apply(update);
        Ok(record.1.clone())
    }

    fn delete(&self, id: &DocumentId) -> Result<bool, StoreError> {
        Ok(self.records.remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<Document>, StoreError> {
        let mut all: Vec<(u64, Document)> = self
            .records
            .iter()
            .map(|r| r.value().clone())
            .collect();
        all.sort_by(|a, b| {
            b.1.created_at
                .cmp(&a.1.created_at)
                .then_with(|| b.0.cmp(&a.0))
        });
        Ok(all.into_iter().map(|(_, d)| d).collect())
    }
}
