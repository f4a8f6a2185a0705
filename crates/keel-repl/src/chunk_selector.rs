//! The chunk-selector contract and an in-memory implementation.

use std::collections::HashSet;
use std::sync::Mutex;

use keel_types::ChunkId;
use tracing::debug;

/// The chunk pool collaborator.
///
/// Both calls are idempotent: marking a busy chunk busy again, or releasing
/// an already free chunk, is a no-op. This is what lets CREATE/SEAL commits
/// be replayed safely after a restart.
pub trait ChunkSelector: Send + Sync {
    /// Mark a specific chunk busy (bound to a shard).
    fn select_specific_chunk(&self, chunk: ChunkId);

    /// Return a chunk's capacity to the pool.
    fn release_chunk(&self, chunk: ChunkId);
}

/// In-memory chunk selector tracking the busy set.
///
/// Used by tests and single-node mode; the data path also consults it to
/// avoid placing new shards on busy chunks.
#[derive(Debug, Default)]
pub struct InMemoryChunkSelector {
    busy: Mutex<HashSet<ChunkId>>,
}

impl InMemoryChunkSelector {
    /// Create a selector with an empty busy set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a chunk is currently marked busy.
    pub fn is_busy(&self, chunk: ChunkId) -> bool {
        self.busy.lock().expect("lock poisoned").contains(&chunk)
    }

    /// Number of busy chunks.
    pub fn busy_count(&self) -> usize {
        self.busy.lock().expect("lock poisoned").len()
    }
}

impl ChunkSelector for InMemoryChunkSelector {
    fn select_specific_chunk(&self, chunk: ChunkId) {
        let inserted = self.busy.lock().expect("lock poisoned").insert(chunk);
        if inserted {
            debug!(chunk, "marked chunk busy");
        }
    }

    fn release_chunk(&self, chunk: ChunkId) {
        let removed = self.busy.lock().expect("lock poisoned").remove(&chunk);
        if removed {
            debug!(chunk, "released chunk");
        }
    }
}
