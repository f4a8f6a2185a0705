//! Concurrent in-memory shard indices.
//!
//! Two maps, two locks: the PG map (PG entry, per-PG sequence counter,
//! ordered shard list, cached chunk hint) under a reader/writer lock, and
//! the shard-ID index under a separate lock guarding individual shard
//! mutations. When both must be held (only when a CREATE commit inserts
//! into both maps), they are acquired PG lock first, shard lock second.
//!
//! The PG's ordered list stores stable [`ShardId`] keys; the shard entries
//! themselves live in the shard-ID index. Appends never invalidate the
//! list, so the keys double as the back-reference from the index into the
//! PG's commit-ordered view.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use keel_repl::ReplDevice;
use keel_types::{ChunkId, PgId, SHARD_WIDTH, ShardId, ShardInfo, ShardState};
use tracing::warn;

use crate::error::ShardError;

/// Directory-side state of one placement group.
pub(crate) struct PgEntry {
    /// Handle to the PG's replication device; absent until the PG's log is
    /// open, during which proposals fail with `PG_NOT_READY`.
    pub repl_dev: Option<Arc<dyn ReplDevice>>,
    /// Highest shard sequence ever observed for this PG on this replica.
    pub shard_sequence_num: u64,
    /// Live shards in commit order.
    pub shards: Vec<ShardId>,
    /// Cached placement hint: the first shard's chunk.
    pub any_allocated_chunk_id: Option<ChunkId>,
}

/// Directory-side state of one shard.
#[derive(Debug, Clone)]
pub(crate) struct ShardEntry {
    /// The replicated shard record.
    pub info: ShardInfo,
    /// Chunk bound at CREATE time.
    pub chunk_id: ChunkId,
}

/// The two concurrent indices described in the module docs.
pub(crate) struct Directory {
    pgs: RwLock<HashMap<PgId, PgEntry>>,
    shards: RwLock<HashMap<ShardId, ShardEntry>>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            pgs: RwLock::new(HashMap::new()),
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// Register a PG, or update its replication device if already present.
    pub fn register_pg(&self, pg_id: PgId, repl_dev: Option<Arc<dyn ReplDevice>>) {
        let mut pgs = self.pgs.write().expect("lock poisoned");
        match pgs.get_mut(&pg_id) {
            Some(entry) => entry.repl_dev = repl_dev,
            None => {
                pgs.insert(
                    pg_id,
                    PgEntry {
                        repl_dev,
                        shard_sequence_num: 0,
                        shards: Vec::new(),
                        any_allocated_chunk_id: None,
                    },
                );
            }
        }
    }

    /// Resolve a PG's replication device for a proposal.
    pub fn repl_dev(&self, pg_id: PgId) -> Result<Arc<dyn ReplDevice>, ShardError> {
        let pgs = self.pgs.read().expect("lock poisoned");
        let Some(entry) = pgs.get(&pg_id) else {
            return Err(ShardError::UnknownPg(pg_id));
        };
        entry
            .repl_dev
            .clone()
            .ok_or(ShardError::PgNotReady(pg_id))
    }

    /// Allocate the next shard ID for a PG by pre-incrementing its sequence.
    ///
    /// Panics if the PG is unknown or its sequence space is exhausted; both
    /// are unrecoverable. Only the proposing replica allocates — followers
    /// adopt the ID carried in the committed payload.
    pub fn allocate_shard_id(&self, pg_id: PgId) -> ShardId {
        let mut pgs = self.pgs.write().expect("lock poisoned");
        let entry = pgs
            .get_mut(&pg_id)
            .unwrap_or_else(|| panic!("shard id allocation for unregistered pg {pg_id}"));
        entry.shard_sequence_num += 1;
        assert!(
            entry.shard_sequence_num < (1u64 << SHARD_WIDTH),
            "pg {pg_id} shard sequence space exhausted"
        );
        ShardId::new(pg_id, entry.shard_sequence_num)
    }

    /// Insert a freshly committed shard into both indices and raise the PG's
    /// sequence to cover it. The only operation that takes both locks.
    ///
    /// Panics on a missing PG or a duplicate shard ID — both mean the
    /// replicated log handed us an impossible commit.
    pub fn insert_shard(&self, entry: ShardEntry) {
        let shard_id = entry.info.id;
        let pg_id = entry.info.placement_group;

        let mut pgs = self.pgs.write().expect("lock poisoned");
        let mut shards = self.shards.write().expect("lock poisoned");

        let pg = pgs
            .get_mut(&pg_id)
            .unwrap_or_else(|| panic!("missing pg {pg_id} for committed shard {shard_id}"));
        pg.shards.push(shard_id);

        let prev = shards.insert(shard_id, entry);
        assert!(prev.is_none(), "duplicate shard {shard_id} inserted");

        // Followers catch up their sequence from adopted IDs here.
        let seq = shard_id.seq();
        if seq > pg.shard_sequence_num {
            pg.shard_sequence_num = seq;
        }
    }

    /// Raise a PG's sequence to at least `seq`.
    pub fn catch_up_sequence(&self, pg_id: PgId, seq: u64) {
        let mut pgs = self.pgs.write().expect("lock poisoned");
        let pg = pgs
            .get_mut(&pg_id)
            .unwrap_or_else(|| panic!("missing pg {pg_id} for committed shard"));
        if seq > pg.shard_sequence_num {
            pg.shard_sequence_num = seq;
        }
    }

    /// Replace a shard's record with the committed value.
    ///
    /// Panics if the shard is unknown: a SEAL commit can only follow the
    /// CREATE the log ordered before it.
    pub fn update_shard(&self, info: ShardInfo) {
        let mut shards = self.shards.write().expect("lock poisoned");
        let entry = shards
            .get_mut(&info.id)
            .unwrap_or_else(|| panic!("missing shard {} for committed update", info.id));
        if entry.info.state == ShardState::Sealed && info.state == ShardState::Open {
            // Sealed is terminal.
            warn!(shard_id = %info.id, "ignoring update that would reopen a sealed shard");
            return;
        }
        entry.info = info;
    }

    pub fn contains_shard(&self, shard_id: ShardId) -> bool {
        self.shards
            .read()
            .expect("lock poisoned")
            .contains_key(&shard_id)
    }

    pub fn shard_state(&self, shard_id: ShardId) -> Option<ShardState> {
        self.shards
            .read()
            .expect("lock poisoned")
            .get(&shard_id)
            .map(|entry| entry.info.state)
    }

    pub fn shard_info(&self, shard_id: ShardId) -> Option<ShardInfo> {
        self.shards
            .read()
            .expect("lock poisoned")
            .get(&shard_id)
            .map(|entry| entry.info.clone())
    }

    /// The chunk a shard was bound to at CREATE.
    pub fn get_shard_chunk(&self, shard_id: ShardId) -> Option<ChunkId> {
        self.shards
            .read()
            .expect("lock poisoned")
            .get(&shard_id)
            .map(|entry| entry.chunk_id)
    }

    /// Any allocated chunk of the PG, as a placement hint for the data path.
    ///
    /// Caches the first shard's chunk on the PG entry; not authoritative.
    pub fn get_any_chunk_id(&self, pg_id: PgId) -> Option<ChunkId> {
        let mut pgs = self.pgs.write().expect("lock poisoned");
        let pg = pgs.get_mut(&pg_id)?;
        if pg.any_allocated_chunk_id.is_some() {
            return pg.any_allocated_chunk_id;
        }

        let first = *pg.shards.first()?;
        let chunk = self
            .shards
            .read()
            .expect("lock poisoned")
            .get(&first)
            .map(|entry| entry.chunk_id);
        pg.any_allocated_chunk_id = chunk;
        chunk
    }

    pub fn shard_sequence_num(&self, pg_id: PgId) -> Option<u64> {
        self.pgs
            .read()
            .expect("lock poisoned")
            .get(&pg_id)
            .map(|pg| pg.shard_sequence_num)
    }

    /// Live shards of a PG in commit order.
    pub fn shards_of(&self, pg_id: PgId) -> Vec<ShardId> {
        self.pgs
            .read()
            .expect("lock poisoned")
            .get(&pg_id)
            .map(|pg| pg.shards.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pg: PgId, seq: u64, chunk: ChunkId) -> ShardEntry {
        let id = ShardId::new(pg, seq);
        ShardEntry {
            info: ShardInfo {
                id,
                placement_group: pg,
                state: ShardState::Open,
                created_time: 1,
                last_modified_time: 1,
                total_capacity_bytes: 1024,
                available_capacity_bytes: 1024,
                deleted_capacity_bytes: 0,
            },
            chunk_id: chunk,
        }
    }

    #[test]
    fn test_unknown_pg() {
        let dir = Directory::new();
        assert!(matches!(dir.repl_dev(9), Err(ShardError::UnknownPg(9))));
    }

    #[test]
    fn test_pg_without_device_not_ready() {
        let dir = Directory::new();
        dir.register_pg(3, None);
        assert!(matches!(dir.repl_dev(3), Err(ShardError::PgNotReady(3))));
    }

    #[test]
    fn test_allocation_pre_increments() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        assert_eq!(dir.allocate_shard_id(7), ShardId::new(7, 1));
        assert_eq!(dir.allocate_shard_id(7), ShardId::new(7, 2));
        assert_eq!(dir.shard_sequence_num(7), Some(2));
    }

    #[test]
    #[should_panic(expected = "unregistered pg")]
    fn test_allocation_for_unknown_pg_panics() {
        Directory::new().allocate_shard_id(42);
    }

    #[test]
    fn test_insert_raises_sequence() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        dir.insert_shard(entry(7, 5, 2));
        assert_eq!(dir.shard_sequence_num(7), Some(5));
        // A lower sequence must not lower the counter.
        dir.insert_shard(entry(7, 3, 4));
        assert_eq!(dir.shard_sequence_num(7), Some(5));
    }

    #[test]
    #[should_panic(expected = "duplicate shard")]
    fn test_duplicate_insert_panics() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        dir.insert_shard(entry(7, 1, 2));
        dir.insert_shard(entry(7, 1, 3));
    }

    #[test]
    fn test_shards_kept_in_insertion_order() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        dir.insert_shard(entry(7, 1, 2));
        dir.insert_shard(entry(7, 2, 3));
        dir.insert_shard(entry(7, 3, 4));
        assert_eq!(
            dir.shards_of(7),
            vec![ShardId::new(7, 1), ShardId::new(7, 2), ShardId::new(7, 3)]
        );
    }

    #[test]
    fn test_get_shard_chunk() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        dir.insert_shard(entry(7, 1, 11));
        assert_eq!(dir.get_shard_chunk(ShardId::new(7, 1)), Some(11));
        assert_eq!(dir.get_shard_chunk(ShardId::new(7, 2)), None);
    }

    #[test]
    fn test_any_chunk_hint_caches_first_shard() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        assert_eq!(dir.get_any_chunk_id(7), None);

        dir.insert_shard(entry(7, 1, 11));
        dir.insert_shard(entry(7, 2, 22));
        assert_eq!(dir.get_any_chunk_id(7), Some(11));
        // Cached; later shards don't change the hint.
        assert_eq!(dir.get_any_chunk_id(7), Some(11));
    }

    #[test]
    fn test_any_chunk_for_unknown_pg_is_none() {
        assert_eq!(Directory::new().get_any_chunk_id(99), None);
    }

    #[test]
    fn test_update_shard_seals() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        dir.insert_shard(entry(7, 1, 11));

        let mut sealed = entry(7, 1, 11).info;
        sealed.state = ShardState::Sealed;
        dir.update_shard(sealed);
        assert_eq!(dir.shard_state(ShardId::new(7, 1)), Some(ShardState::Sealed));
    }

    #[test]
    fn test_sealed_shard_never_reopens() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        dir.insert_shard(entry(7, 1, 11));

        let mut sealed = entry(7, 1, 11).info;
        sealed.state = ShardState::Sealed;
        dir.update_shard(sealed);

        let reopened = entry(7, 1, 11).info;
        dir.update_shard(reopened);
        assert_eq!(dir.shard_state(ShardId::new(7, 1)), Some(ShardState::Sealed));
    }

    #[test]
    #[should_panic(expected = "missing shard")]
    fn test_update_unknown_shard_panics() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        dir.update_shard(entry(7, 1, 11).info);
    }

    #[test]
    fn test_register_pg_twice_keeps_state() {
        let dir = Directory::new();
        dir.register_pg(7, None);
        dir.insert_shard(entry(7, 1, 11));
        dir.register_pg(7, None);
        assert_eq!(dir.shard_sequence_num(7), Some(1));
        assert_eq!(dir.shards_of(7).len(), 1);
    }
}
