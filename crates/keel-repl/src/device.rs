//! The replication-device contract.

use std::sync::Arc;

use bytes::Bytes;
use keel_types::{ChunkId, Lsn};
use serde::{Deserialize, Serialize};

use crate::error::ReplError;

/// Opaque handle identifying an in-flight proposal.
///
/// The proposing replica passes a `ReqId` into
/// [`ReplDevice::async_alloc_write`]; the device returns it, untouched,
/// inside the [`CommitCtx`] delivered with that entry's commit. Followers
/// and restart replay see no request id.
pub type ReqId = u64;

/// Block addresses assigned by a device allocation.
///
/// Carried in the log entry and redelivered at commit time; the chunk
/// number is the chunk a CREATE commit binds its shard to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIds {
    /// Chunk the blocks were allocated from.
    pub chunk: ChunkId,
    /// First block within the chunk.
    pub start_blk: u64,
    /// Number of contiguous blocks.
    pub blk_count: u32,
}

impl BlockIds {
    /// The chunk the blocks live in.
    pub fn chunk_num(&self) -> ChunkId {
        self.chunk
    }
}

/// Context delivered alongside a live commit.
///
/// Present on every replica for entries committed while the process was
/// running; absent during restart replay (the payload must then be read
/// back from the entry's [`BlockIds`]).
pub struct CommitCtx {
    /// The key blob passed to [`ReplDevice::async_alloc_write`] — for shard
    /// operations, the padded payload itself.
    pub payload: Bytes,
    /// The proposer's request handle. `Some` only on the proposing replica.
    pub req: Option<ReqId>,
}

/// Receiver of committed log entries.
///
/// Invoked for every committed entry, on every replica, in log order —
/// both in steady state and during restart replay. Implementations must be
/// reentrant across PGs; the log itself serialises delivery within a PG.
#[async_trait::async_trait]
pub trait CommitListener: Send + Sync {
    /// Apply one committed entry.
    async fn on_commit(
        &self,
        lsn: Lsn,
        header: Bytes,
        blk_ids: BlockIds,
        device: Arc<dyn ReplDevice>,
        ctx: Option<CommitCtx>,
    );
}

/// A per-PG replicated log.
///
/// Headers are opaque byte blobs to the device; it persists them alongside
/// the payload and redelivers both at commit time.
#[async_trait::async_trait]
pub trait ReplDevice: Send + Sync {
    /// The device's block size in bytes. Payloads must be padded to a
    /// multiple of this and are CRCed over the padded length.
    fn block_size(&self) -> u64;

    /// Allocate blocks, write `value` into them, and append a log entry
    /// carrying `header` and the block addresses. Resolves with the entry's
    /// LSN once the entry is committed and dispatched.
    async fn async_alloc_write(
        &self,
        header: Bytes,
        key: Bytes,
        value: Bytes,
        ctx: Option<ReqId>,
    ) -> Result<Lsn, ReplError>;

    /// Read `size` bytes back from previously allocated blocks.
    async fn async_read(&self, blk_ids: BlockIds, size: u64) -> Result<Bytes, ReplError>;
}

/// Configuration for the in-memory replication device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Block size in bytes. Payloads are padded to a multiple of this.
    pub block_size: u64,
    /// Number of replicas sharing the log.
    pub replicas: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            replicas: 3,
        }
    }
}
