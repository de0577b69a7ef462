//!
//! The logical-to-physical map and its write-back sink. The source leaves
//! both to an external caller (`mpe` metadata persistence engine, an
//! application-supplied index); this crate defines the minimal trait
//! boundary and ships an in-memory map so the core is usable standalone.
use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::ZtlError;
use crate::wca::Piece;

/// Maps a user logical block address to the pieces of media it landed on.
pub trait Index: Send + Sync {
    fn upsert(&self, starting_lba: u64, pieces: &[Piece]) -> Result<(), ZtlError>;

    fn lookup(&self, starting_lba: u64) -> Option<Vec<Piece>>;
}

/// Persists mapping changes out of process (WAL, remote metadata service,
/// etc). The default does nothing; callers needing durability provide their
/// own.
pub trait MetadataSink: Send + Sync {
    fn flush(&self, _pieces: &[Piece]) -> Result<(), ZtlError> {
        Ok(())
    }
}

pub struct NoopMetadataSink;

impl MetadataSink for NoopMetadataSink {}

#[derive(Default)]
pub struct InMemoryIndex {
    map: RwLock<HashMap<u64, Vec<Piece>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index for InMemoryIndex {
    fn upsert(&self, starting_lba: u64, pieces: &[Piece]) -> Result<(), ZtlError> {
        self.map.write().insert(starting_lba, pieces.to_vec());
        Ok(())
    }

    fn lookup(&self, starting_lba: u64) -> Option<Vec<Piece>> {
        self.map.read().get(&starting_lba).cloned()
    }
}
