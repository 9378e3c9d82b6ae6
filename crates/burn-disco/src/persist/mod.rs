//! Non-blocking persistence of result collections
//!
//! Each destination gets its own [`DestinationWorker`] thread. The sampling
//! loop only enqueues; reading the shared collection and writing happen on
//! the worker once the current sampling step has finished.

mod gate;
mod store;
mod worker;

pub use gate::SampleGate;
pub use store::{LocalStore, MemoryStore, SnapshotStore, SNAPSHOT_FILE};
pub use worker::DestinationWorker;

use std::path::Path;
use std::sync::{Arc, Mutex};

use burn_disco_core::EnvSettings;
use thiserror::Error;
use tracing::info;

use crate::results::ResultCollection;
use crate::snapshot::SnapshotError;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Remote store error: {0}")]
    Remote(String),
}

/// Dispatches snapshots to every configured destination
pub struct PersistenceManager {
    gate: Arc<SampleGate>,
    workers: Vec<DestinationWorker>,
}

impl Default for PersistenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceManager {
    /// Manager without destinations
    pub fn new() -> Self {
        Self {
            gate: Arc::new(SampleGate::new()),
            workers: Vec::new(),
        }
    }

    /// Local store under `run_dir` plus an optional remote, honoring opt-outs
    pub fn from_env(
        env: &EnvSettings,
        run_dir: &Path,
        remote: Option<Box<dyn SnapshotStore>>,
    ) -> Self {
        let mut manager = Self::new();
        if env.optout_local_backup {
            info!("local snapshots disabled");
        } else {
            manager.add_destination(Box::new(LocalStore::new(run_dir)));
        }
        match remote {
            Some(_) if env.optout_cloud_backup => info!("remote snapshots disabled"),
            Some(store) => manager.add_destination(store),
            None => {}
        }
        manager
    }

    pub fn add_destination(&mut self, store: Box<dyn SnapshotStore>) {
        self.workers
            .push(DestinationWorker::spawn(store, self.gate.clone()));
    }

    pub fn with_destination(mut self, store: Box<dyn SnapshotStore>) -> Self {
        self.add_destination(store);
        self
    }

    /// Gate the sampling loop marks its steps with
    pub fn gate(&self) -> Arc<SampleGate> {
        self.gate.clone()
    }

    pub fn destinations(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.label()).collect()
    }

    /// Fire-and-forget snapshot to every destination
    ///
    /// Returns how many destinations accepted the job.
    pub fn dispatch(&self, collection: &Arc<Mutex<ResultCollection>>, force: bool) -> usize {
        self.workers
            .iter()
            .filter(|w| w.dispatch(collection, force))
            .count()
    }

    /// Wait for all queued jobs
    pub fn flush(&self) {
        for worker in &self.workers {
            worker.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ResultRecord;

    #[test]
    fn test_from_env_respects_optouts() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = EnvSettings {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let manager = PersistenceManager::from_env(&env, dir.path(), Some(Box::new(MemoryStore::new("remote"))));
        assert_eq!(manager.destinations(), vec!["local", "remote"]);

        env.optout_local_backup = true;
        env.optout_cloud_backup = true;
        let manager = PersistenceManager::from_env(&env, dir.path(), Some(Box::new(MemoryStore::new("remote"))));
        assert!(manager.destinations().is_empty());
    }

    #[test]
    fn test_disjoint_dispatches_merge() {
        let store = MemoryStore::new("remote");
        let manager = PersistenceManager::new().with_destination(Box::new(store.clone()));
        let a = ResultRecord::new(0, 1, String::new());
        let b = ResultRecord::new(1, 2, String::new());

        let first = Arc::new(Mutex::new(ResultCollection {
            records: vec![a.clone()],
        }));
        let second = Arc::new(Mutex::new(ResultCollection {
            records: vec![b.clone()],
        }));
        assert_eq!(manager.dispatch(&first, true), 1);
        manager.flush();
        assert_eq!(manager.dispatch(&second, true), 1);
        manager.flush();

        let stored = store.snapshot().unwrap().unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.get(&a.id).is_some());
        assert!(stored.get(&b.id).is_some());
    }
}
