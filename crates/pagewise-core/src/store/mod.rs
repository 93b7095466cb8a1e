//! Document records and binary objects.
//!
//! Both collaborators are plain synchronous traits; the concrete record
//! store is picked once at startup by [`open_document_store`].

pub mod memory;
pub mod objects;
pub mod sqlite;

use std::sync::Arc;

use thiserror::Error;

use crate::StorageConfig;
use crate::model::{Document, DocumentId, DocumentUpdate};

pub use memory::MemoryDocumentStore;
pub use objects::{LocalObjectStore, MemoryObjectStore};
pub use sqlite::SqliteDocumentStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persisted document records.
pub trait DocumentStore: Send + Sync {
    fn create(&self, document: &Document) -> Result<(), StoreError>;

    fn get(&self, id: &DocumentId) -> Result<Option<Document>, StoreError>;

    /// Apply a partial update and return the updated record.
    /// Fails with [`StoreError::NotFound`] if the record does not exist.
    fn update(&self, id: &DocumentId, update: DocumentUpdate) -> Result<Document, StoreError>;

    fn delete(&self, id: &DocumentId) -> Result<bool, StoreError>;

    /// All records, newest first.
    fn list(&self) -> Result<Vec<Document>, StoreError>;
}

/// Binary storage for original uploads, addressed by opaque locators.
pub trait ObjectStore: Send + Sync {
    fn put(&self, bytes: &[u8]) -> Result<String, StoreError>;

    fn get(&self, locator: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn delete(&self, locator: &str) -> Result<bool, StoreError>;

    fn exists(&self, locator: &str) -> Result<bool, StoreError>;
}

/// Record store backends selectable by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

impl StorageBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(StorageBackend::Sqlite),
            "memory" => Some(StorageBackend::Memory),
            _ => None,
        }
    }
}

/// Open the configured record store.
pub fn open_document_store(config: &StorageConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryDocumentStore::new())),
        StorageBackend::Sqlite => {
            if let Some(parent) = config.database_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = SqliteDocumentStore::open(&config.database_path)?;
            tracing::info!(path = %config.database_path.display(), "opened document store");
            Ok(Arc::new(store))
        }
    }
}

/// Open the configured object store.
pub fn open_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryObjectStore::new())),
        StorageBackend::Sqlite => Ok(Arc::new(LocalObjectStore::open(&config.upload_dir)?)),
    }
}
