//! Replication-device and chunk-selector contracts for Keel.
//!
//! The shard manager consumes two process-wide collaborators through the
//! traits defined here:
//!
//! - [`ReplDevice`] — a per-PG replicated log. The device persists an opaque
//!   header blob alongside a block-aligned payload, assigns an LSN on quorum
//!   commit, and redelivers `(lsn, header, block ids)` to a
//!   [`CommitListener`] on every replica, both live and during restart
//!   replay.
//! - [`ChunkSelector`] — the chunk pool. The shard manager only marks chunks
//!   busy ([`ChunkSelector::select_specific_chunk`]) and returns them
//!   ([`ChunkSelector::release_chunk`]); both calls are idempotent.
//!
//! [`MemReplDevice`] is the in-memory device used by tests and single-node
//! mode: a group of replicas sharing one ordered log.

mod chunk_selector;
mod device;
mod error;
mod mem_device;

pub use chunk_selector::{ChunkSelector, InMemoryChunkSelector};
pub use device::{BlockIds, CommitCtx, CommitListener, DeviceConfig, ReplDevice, ReqId};
pub use error::ReplError;
pub use mem_device::MemReplDevice;
