//! Snapshot destinations

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::PersistError;
use crate::results::ResultCollection;
use crate::snapshot;

pub const SNAPSHOT_FILE: &str = "snapshot.bin.lz4";

/// A place snapshots are read from and written to
pub trait SnapshotStore: Send {
    /// Short name used in logs
    fn label(&self) -> &str;

    /// Previously stored collection, `None` if nothing was written yet
    fn load(&self) -> Result<Option<ResultCollection>, PersistError>;

    /// Replace the stored collection
    fn store(&mut self, collection: &ResultCollection) -> Result<(), PersistError>;
}

/// Snapshot file in a run directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for LocalStore {
    fn label(&self) -> &str {
        "local"
    }

    fn load(&self) -> Result<Option<ResultCollection>, PersistError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        Ok(Some(snapshot::decode(&bytes)?))
    }

    fn store(&mut self, collection: &ResultCollection) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = snapshot::encode(collection)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-process store, cloned handles share the same contents
#[derive(Debug, Clone)]
pub struct MemoryStore {
    label: String,
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bytes: Arc::new(Mutex::new(None)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of completed writes
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Decode the stored snapshot
    pub fn snapshot(&self) -> Result<Option<ResultCollection>, PersistError> {
        self.load()
    }
}

impl SnapshotStore for MemoryStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn load(&self) -> Result<Option<ResultCollection>, PersistError> {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        match bytes.as_deref() {
            Some(data) => Ok(Some(snapshot::decode(data)?)),
            None => Ok(None),
        }
    }

    fn store(&mut self, collection: &ResultCollection) -> Result<(), PersistError> {
        let encoded = snapshot::encode(collection)?;
        *self.bytes.lock().unwrap_or_else(PoisonError::into_inner) = Some(encoded);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ResultRecord;

    fn collection() -> ResultCollection {
        ResultCollection {
            records: vec![ResultRecord::new(0, 7, "{}".into())],
        }
    }

    #[test]
    fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LocalStore::new(dir.path().join("run"));
        assert!(store.load().unwrap().is_none());

        store.store(&collection()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.records[0].seed, 7);
        assert!(store.path().exists());
    }

    #[test]
    fn test_memory_store_shares_contents() {
        let store = MemoryStore::new("remote");
        let mut writer = store.clone();
        writer.store(&collection()).unwrap();
        assert_eq!(store.writes(), 1);
        assert_eq!(store.snapshot().unwrap().unwrap().len(), 1);
    }
}
