use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::gate::SampleGate;
use super::store::SnapshotStore;
use super::PersistError;
use crate::results::ResultCollection;

enum Message {
    Persist(Arc<Mutex<ResultCollection>>),
    Flush(Sender<()>),
}

/// Single-consumer queue writing snapshots to one destination
///
/// Jobs for the same destination run one at a time in submission order.
pub struct DestinationWorker {
    label: String,
    tx: Option<Sender<Message>>,
    pending: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl DestinationWorker {
    pub fn spawn(mut store: Box<dyn SnapshotStore>, gate: Arc<SampleGate>) -> Self {
        let label = store.label().to_string();
        let pending = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel::<Message>();

        let handle = {
            let pending = pending.clone();
            thread::spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Persist(collection) => {
                            gate.wait_idle();
                            let update = collection
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .clone();
                            match persist(store.as_mut(), update) {
                                Ok(records) => {
                                    debug!("{}: stored {} records", store.label(), records)
                                }
                                Err(e) => warn!("{}: persisting failed: {}", store.label(), e),
                            }
                            pending.fetch_sub(1, Ordering::SeqCst);
                        }
                        Message::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
        };

        Self {
            label,
            tx: Some(tx),
            pending,
            handle: Some(handle),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether a job is queued or running
    pub fn is_busy(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Queue a write of `collection`
    ///
    /// Without `force` the call is dropped while another job is pending.
    /// Returns whether a job was queued.
    pub fn dispatch(&self, collection: &Arc<Mutex<ResultCollection>>, force: bool) -> bool {
        if force {
            self.pending.fetch_add(1, Ordering::SeqCst);
        } else if self
            .pending
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("{}: busy, skipping snapshot", self.label);
            return false;
        }

        let sent = self
            .tx
            .as_ref()
            .is_some_and(|tx| tx.send(Message::Persist(collection.clone())).is_ok());
        if !sent {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("{}: worker is gone, snapshot dropped", self.label);
        }
        sent
    }

    /// Block until every job queued so far has finished
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = channel();
        if tx.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

impl Drop for DestinationWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{}: worker panicked", self.label);
            }
        }
    }
}

/// Read-merge-write of one destination, returns the stored record count
fn persist(
    store: &mut dyn SnapshotStore,
    update: ResultCollection,
) -> Result<usize, PersistError> {
    let mut merged = match store.load() {
        Ok(existing) => existing.unwrap_or_default(),
        Err(e) => {
            warn!("{}: unreadable snapshot, replacing it: {}", store.label(), e);
            ResultCollection::default()
        }
    };
    merged.merge(update);
    store.store(&merged)?;
    Ok(merged.len())
}
