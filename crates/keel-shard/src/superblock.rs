//! Durable per-shard superblock.
//!
//! One superblock per shard, in the named-blob family `"shard"`. It carries
//! every [`ShardInfo`] field plus the bound chunk, and is the source of
//! truth on restart for shards whose commit was applied before the crash;
//! the replicated log covers the rest.

use keel_meta::{MetaError, SuperblockStore};
use keel_types::{ChunkId, ShardInfo};
use serde::{Deserialize, Serialize};

/// Blob family holding shard superblocks.
pub const SHARD_SUPERBLOCK_FAMILY: &str = "shard";

/// The durable shard record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSuperblock {
    /// The replicated shard record at the last applied commit.
    pub info: ShardInfo,
    /// Chunk bound at CREATE time.
    pub chunk_id: ChunkId,
}

impl ShardSuperblock {
    pub fn new(info: ShardInfo, chunk_id: ChunkId) -> Self {
        Self { info, chunk_id }
    }

    /// Atomically write (create or replace) this shard's superblock.
    pub fn write(&self, store: &SuperblockStore) -> Result<(), MetaError> {
        let bytes = postcard::to_allocvec(self).expect("serialization should not fail");
        store.write(
            SHARD_SUPERBLOCK_FAMILY,
            &self.info.id.to_be_bytes(),
            &bytes,
        )
    }

    fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        postcard::from_bytes(bytes).map_err(|e| MetaError::CorruptData(e.to_string()))
    }

    /// Enumerate every shard superblock in the store, ordered by shard ID
    /// (the store keys are big-endian IDs).
    pub fn load_all(store: &SuperblockStore) -> Result<Vec<ShardSuperblock>, MetaError> {
        store
            .load_family(SHARD_SUPERBLOCK_FAMILY)?
            .iter()
            .map(|(_, bytes)| Self::decode(bytes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use keel_types::{ShardId, ShardState};

    use super::*;

    fn superblock(pg: u16, seq: u64, chunk: ChunkId) -> ShardSuperblock {
        ShardSuperblock::new(
            ShardInfo {
                id: ShardId::new(pg, seq),
                placement_group: pg,
                state: ShardState::Open,
                created_time: 10,
                last_modified_time: 10,
                total_capacity_bytes: 4096,
                available_capacity_bytes: 4096,
                deleted_capacity_bytes: 0,
            },
            chunk,
        )
    }

    #[test]
    fn test_write_load_roundtrip() {
        let store = SuperblockStore::in_memory();
        let sb = superblock(7, 1, 3);
        sb.write(&store).unwrap();

        let loaded = ShardSuperblock::load_all(&store).unwrap();
        assert_eq!(loaded, vec![sb]);
    }

    #[test]
    fn test_rewrite_replaces() {
        let store = SuperblockStore::in_memory();
        let mut sb = superblock(7, 1, 3);
        sb.write(&store).unwrap();

        sb.info.state = ShardState::Sealed;
        sb.write(&store).unwrap();

        let loaded = ShardSuperblock::load_all(&store).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].info.state, ShardState::Sealed);
    }

    #[test]
    fn test_load_all_ordered_by_shard_id() {
        let store = SuperblockStore::in_memory();
        superblock(7, 3, 1).write(&store).unwrap();
        superblock(7, 1, 2).write(&store).unwrap();
        superblock(2, 9, 3).write(&store).unwrap();

        let ids: Vec<ShardId> = ShardSuperblock::load_all(&store)
            .unwrap()
            .iter()
            .map(|sb| sb.info.id)
            .collect();
        assert_eq!(
            ids,
            vec![ShardId::new(2, 9), ShardId::new(7, 1), ShardId::new(7, 3)]
        );
    }

    #[test]
    fn test_corrupt_blob_is_reported() {
        let store = SuperblockStore::in_memory();
        store
            .write(SHARD_SUPERBLOCK_FAMILY, b"bogus", b"\xff\xff")
            .unwrap();
        assert!(matches!(
            ShardSuperblock::load_all(&store),
            Err(MetaError::CorruptData(_))
        ));
    }
}
