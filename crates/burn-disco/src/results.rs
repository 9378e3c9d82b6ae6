//! Result records
//!
//! One [`ResultRecord`] per batch, identified by a UUID so that snapshots
//! written at different times can be merged record by record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status tags of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordStatus {
    pub completed: bool,
    /// Remaining trajectory index, `-1` once finished
    pub cur_t: i64,
    /// Forward step count reached
    pub step: usize,
    /// Total guidance loss per step
    pub loss: Vec<f64>,
}

/// A saved image of one batch element at one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageChunk {
    pub step: usize,
    pub cur_t: i64,
    pub loss: Option<f64>,
    /// Index within the batch
    pub minibatch_idx: usize,
    pub width: usize,
    pub height: usize,
    /// Interleaved RGB, `width * height * 3` bytes
    pub rgb: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Uuid,
    pub batch_index: usize,
    pub seed: u64,
    /// Run configuration as JSON
    pub config: String,
    pub status: RecordStatus,
    pub chunks: Vec<ImageChunk>,
}

impl ResultRecord {
    pub fn new(batch_index: usize, seed: u64, config: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_index,
            seed,
            config,
            status: RecordStatus::default(),
            chunks: Vec::new(),
        }
    }

    /// Latest chunk per batch element
    pub fn latest_chunks(&self) -> Vec<&ImageChunk> {
        let mut latest: Vec<&ImageChunk> = Vec::new();
        for chunk in &self.chunks {
            match latest
                .iter_mut()
                .find(|c| c.minibatch_idx == chunk.minibatch_idx)
            {
                Some(slot) if slot.step <= chunk.step => *slot = chunk,
                Some(_) => {}
                None => latest.push(chunk),
            }
        }
        latest
    }
}

/// Ordered collection of result records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultCollection {
    pub records: Vec<ResultRecord>,
}

impl ResultCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&ResultRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut ResultRecord> {
        self.records.iter_mut().find(|r| &r.id == id)
    }

    /// Insert `record`, replacing any record with the same id in place
    pub fn upsert(&mut self, record: ResultRecord) {
        match self.get_mut(&record.id) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    /// Merge `other` into `self` by identity; records from `other` win
    pub fn merge(&mut self, other: ResultCollection) {
        for record in other.records {
            self.upsert(record);
        }
    }

    pub fn completed(&self) -> usize {
        self.records.iter().filter(|r| r.status.completed).count()
    }
}
