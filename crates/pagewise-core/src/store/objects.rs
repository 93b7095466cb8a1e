use std::path::{Path, PathBuf};

use dashmap::DashMap;

use super::{ObjectStore, StoreError};

/// Locators are bare file names; anything that could escape the directory is rejected.
fn is_safe_locator(locator: &str) -> bool {
    !locator.is_empty()
        && !locator.contains(['/', '\\'])
        && locator != "."
        && locator != ".."
}

fn new_locator() -> String {
    format!("{}.pdf", uuid::Uuid::new_v4())
}

/// Objects stored as files in one upload directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Use `root`, creating it if needed.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, locator: &str) -> Option<PathBuf> {
        is_safe_locator(locator).then(|| self.root.join(locator))
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let locator = new_locator();
        std::fs::write(self.root.join(&locator), bytes)?;
        tracing::debug!(locator = %locator, bytes = bytes.len(), "stored upload");
        Ok(locator)
    }

    fn get(&self, locator: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(path) = self.path_for(locator) else {
            return Ok(None);
        };
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, locator: &str) -> Result<bool, StoreError> {
        let Some(path) = self.path_for(locator) else {
            return Ok(false);
        };
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, locator: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(locator).is_some_and(|p| p.is_file()))
    }
}

/// Objects held in memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let locator = new_locator();
        self.objects.insert(locator.clone(), bytes.to_vec());
        Ok(locator)
    }

    fn get(&self, locator: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects.get(locator).map(|b| b.value().clone()))
    }

    fn delete(&self, locator: &str) -> Result<bool, StoreError> {
        Ok(self.objects.remove(locator).is_some())
    }

    fn exists(&self, locator: &str) -> Result<bool, StoreError> {
        Ok(self.objects.contains_key(locator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn ObjectStore) {
        let loc = store.put(b"%PDF-1.4 body").unwrap();
        assert!(loc.ends_with(".pdf"));
        assert!(store.exists(&loc).unwrap());
        assert_eq!(store.get(&loc).unwrap().unwrap(), b"%PDF-1.4 body");
        assert!(store.delete(&loc).unwrap());
        assert!(!store.delete(&loc).unwrap());
        assert!(!store.exists(&loc).unwrap());
        assert!(store.get(&loc).unwrap().is_none());
    }

    #[test]
    fn memory_store() {
        exercise(&MemoryObjectStore::new());
    }

    #[test]
    fn local_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&LocalObjectStore::open(&dir.path().join("uploads")).unwrap());
    }

    #[test]
    fn local_store_rejects_escaping_locators() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.pdf"), b"x").unwrap();
        let store = LocalObjectStore::open(&dir.path().join("uploads")).unwrap();
        assert!(store.get("../secret.pdf").unwrap().is_none());
        assert!(!store.exists("..").unwrap());
        assert!(!store.delete("../secret.pdf").unwrap());
        assert!(dir.path().join("secret.pdf").exists());
    }
}
