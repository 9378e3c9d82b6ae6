//! Snapshot codec
//!
//! A snapshot is a versioned [`ResultCollection`] serialized with bincode and
//! compressed with lz4.

use std::io::{self, Read, Write};

use lz4::EncoderBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::results::ResultCollection;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Unsupported snapshot version {0}")]
    Version(u32),
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    collection: ResultCollection,
}

/// Serialize and compress a collection
pub fn encode(collection: &ResultCollection) -> Result<Vec<u8>, SnapshotError> {
    let file = SnapshotFile {
        version: SNAPSHOT_VERSION,
        collection: collection.clone(),
    };
    let raw = bincode::serialize(&file)?;

    let mut encoder = EncoderBuilder::new().build(Vec::new())?;
    encoder.write_all(&raw)?;
    let (compressed, result) = encoder.finish();
    result?;
    Ok(compressed)
}

/// Decompress and deserialize a collection
pub fn decode(data: &[u8]) -> Result<ResultCollection, SnapshotError> {
    let mut decoder = lz4::Decoder::new(data)?;
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;

    let file: SnapshotFile = bincode::deserialize(&raw)?;
    if file.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::Version(file.version));
    }
    Ok(file.collection)
}
