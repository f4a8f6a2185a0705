//! [`ShardManager`] — allocation, proposal, and recovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use keel_meta::{MetaError, SuperblockStore};
use keel_repl::{ChunkSelector, ReplDevice, ReqId};
use keel_types::{ChunkId, MonotonicClock, PgId, SHARD_WIDTH, ShardId, ShardInfo, ShardState};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::codec::{self, MessageHeader, MessageType};
use crate::directory::{Directory, ShardEntry};
use crate::error::ShardError;
use crate::superblock::ShardSuperblock;

/// Largest capacity a single shard may reserve: 1 GiB.
const MAX_SHARD_SIZE: u64 = 1024 * 1024 * 1024;

/// Result a proposer future resolves with.
pub(crate) type CommitResult = Result<ShardInfo, ShardError>;

/// The shard manager of one replica.
///
/// Proposals (CREATE/SEAL) go through the PG's replication device; the
/// manager is also the device's commit listener, applying every committed
/// entry (its own and its peers') to the in-memory directory and the
/// durable superblock store. Apply is idempotent, so the same path serves
/// restart replay.
pub struct ShardManager {
    pub(crate) directory: Directory,
    pub(crate) superblocks: Arc<SuperblockStore>,
    pub(crate) chunk_selector: Arc<dyn ChunkSelector>,
    clock: MonotonicClock,
    /// In-flight proposals awaiting local commit, keyed by the opaque
    /// request handle carried through the replication device.
    inflight: Mutex<HashMap<ReqId, oneshot::Sender<CommitResult>>>,
    next_req: AtomicU64,
}

impl ShardManager {
    /// Create a manager over the given superblock store and chunk selector.
    pub fn new(
        superblocks: Arc<SuperblockStore>,
        chunk_selector: Arc<dyn ChunkSelector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory: Directory::new(),
            superblocks,
            chunk_selector,
            clock: MonotonicClock::new(),
            inflight: Mutex::new(HashMap::new()),
            next_req: AtomicU64::new(1),
        })
    }

    /// Largest capacity a single shard may reserve.
    pub fn max_shard_size() -> u64 {
        MAX_SHARD_SIZE
    }

    /// Maximum number of shards a PG can ever allocate.
    pub fn max_shard_num_in_pg() -> u64 {
        1u64 << SHARD_WIDTH
    }

    /// Register a PG, or update its replication device if already present.
    /// A PG without a device rejects proposals with `PG_NOT_READY`.
    pub fn register_pg(&self, pg_id: PgId, repl_dev: Option<Arc<dyn ReplDevice>>) {
        self.directory.register_pg(pg_id, repl_dev);
    }

    /// Rebuild directory state from superblocks written before a restart.
    ///
    /// Must run after the PGs are registered and before log replay: replay
    /// then observes recovered shards as already present and skips them.
    /// Chunks of recovered `Open` shards are re-marked busy; `Sealed` shards
    /// already returned theirs to the pool. Returns the number of shards
    /// recovered.
    pub fn recover(&self) -> Result<usize, MetaError> {
        let superblocks = ShardSuperblock::load_all(&self.superblocks)?;
        let count = superblocks.len();
        for sb in superblocks {
            if sb.info.state == ShardState::Open {
                self.chunk_selector.select_specific_chunk(sb.chunk_id);
            }
            self.directory.insert_shard(ShardEntry {
                info: sb.info,
                chunk_id: sb.chunk_id,
            });
        }
        info!(count, "recovered shard superblocks");
        Ok(count)
    }

    /// Create a new shard in a PG with the given fixed capacity.
    ///
    /// Resolves once the CREATE entry commits locally, with the shard record
    /// every replica converged on.
    pub async fn create_shard(&self, pg_id: PgId, size_bytes: u64) -> CommitResult {
        let repl_dev = match self.directory.repl_dev(pg_id) {
            Ok(dev) => dev,
            Err(e) => {
                warn!(pg_id, %e, "cannot create shard");
                return Err(e);
            }
        };

        let id = self.directory.allocate_shard_id(pg_id);
        let now = self.clock.tick();
        let info = ShardInfo {
            id,
            placement_group: pg_id,
            state: ShardState::Open,
            created_time: now,
            last_modified_time: now,
            total_capacity_bytes: size_bytes,
            available_capacity_bytes: size_bytes,
            deleted_capacity_bytes: 0,
        };

        self.propose(&repl_dev, MessageType::CreateShard, info).await
    }

    /// Seal a shard, making it immutable and returning its chunk's capacity
    /// to the pool.
    ///
    /// Timestamps travel with the proposal unchanged so that every replica
    /// records identical values. Sealing an already sealed shard is a no-op
    /// that still resolves with the committed record.
    pub async fn seal_shard(&self, info: &ShardInfo) -> CommitResult {
        let pg_id = info.placement_group;
        let repl_dev = match self.directory.repl_dev(pg_id) {
            Ok(dev) => dev,
            Err(e) => {
                warn!(pg_id, shard_id = %info.id, %e, "cannot seal shard");
                return Err(e);
            }
        };

        let mut sealed = info.clone();
        sealed.state = ShardState::Sealed;

        self.propose(&repl_dev, MessageType::SealShard, sealed).await
    }

    /// The chunk a shard was bound to at CREATE.
    pub fn get_shard_chunk(&self, shard_id: ShardId) -> Option<ChunkId> {
        self.directory.get_shard_chunk(shard_id)
    }

    /// Any allocated chunk of the PG — a cached, non-authoritative placement
    /// hint for the data path.
    pub fn get_any_chunk_id(&self, pg_id: PgId) -> Option<ChunkId> {
        self.directory.get_any_chunk_id(pg_id)
    }

    /// The highest shard sequence observed for a PG on this replica.
    pub fn shard_sequence_num(&self, pg_id: PgId) -> Option<u64> {
        self.directory.shard_sequence_num(pg_id)
    }

    /// Live shards of a PG in commit order.
    pub fn shards_of(&self, pg_id: PgId) -> Vec<ShardId> {
        self.directory.shards_of(pg_id)
    }

    /// A shard's current record on this replica.
    pub fn shard_info(&self, shard_id: ShardId) -> Option<ShardInfo> {
        self.directory.shard_info(shard_id)
    }

    /// Frame, align, CRC, and submit one shard operation, then wait for the
    /// committer to resolve it.
    async fn propose(
        &self,
        repl_dev: &Arc<dyn ReplDevice>,
        msg_type: MessageType,
        info: ShardInfo,
    ) -> CommitResult {
        let payload = codec::pad_to_blocks(codec::encode_shard_info(&info), repl_dev.block_size());
        let header = MessageHeader::new(msg_type, info.placement_group, info.id, &payload).seal();

        let (req, rx) = self.register_request();
        let lsn = match repl_dev
            .async_alloc_write(
                Bytes::copy_from_slice(&header.encode()),
                payload.clone(),
                payload,
                Some(req),
            )
            .await
        {
            Ok(lsn) => lsn,
            Err(e) => {
                self.inflight.lock().expect("lock poisoned").remove(&req);
                return Err(e.into());
            }
        };
        debug!(shard_id = %info.id, ?msg_type, lsn, "submitted shard proposal");

        rx.await.map_err(|_| ShardError::NotificationLost)?
    }

    /// Register an in-flight proposal; the committer resolves it by request
    /// handle on local commit.
    pub(crate) fn register_request(&self) -> (ReqId, oneshot::Receiver<CommitResult>) {
        let req = self.next_req.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inflight.lock().expect("lock poisoned").insert(req, tx);
        (req, rx)
    }

    /// Resolve an in-flight proposal, if the commit carried one.
    ///
    /// A missing receiver means the caller cancelled; the commit stands and
    /// its result is discarded.
    pub(crate) fn resolve_request(&self, req: Option<ReqId>, result: CommitResult) {
        let Some(req) = req else { return };
        let sender = self.inflight.lock().expect("lock poisoned").remove(&req);
        match sender {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!(req, "proposer gave up before commit");
                }
            }
            None => debug!(req, "commit for request no longer in flight"),
        }
    }
}
