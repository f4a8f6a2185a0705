//! In-memory replication device: a replica group sharing one ordered log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use keel_types::Lsn;
use tokio::sync::watch;
use tracing::debug;

use crate::device::{BlockIds, CommitCtx, CommitListener, DeviceConfig, ReplDevice, ReqId};
use crate::error::ReplError;

/// One committed log entry.
#[derive(Clone)]
struct LogRecord {
    lsn: Lsn,
    header: Bytes,
    blk_ids: BlockIds,
}

/// State shared by every replica of the group.
struct SharedLog {
    block_size: u64,
    /// Committed entries in log order. The next LSN is `records.len() + 1`.
    records: Mutex<Vec<LogRecord>>,
    /// Durable block contents, keyed by the allocation that wrote them.
    blocks: Mutex<HashMap<BlockIds, Bytes>>,
    /// Fresh chunk per allocation.
    next_chunk: AtomicU16,
    /// LSN whose dispatch may run next. Keeps commit delivery in log order
    /// even when proposals race.
    dispatch_turn: watch::Sender<Lsn>,
    /// All replicas of the group, for commit fan-out.
    replicas: Mutex<Vec<Weak<MemReplDevice>>>,
}

/// One replica's handle onto the shared log.
///
/// Commits are delivered to every replica's attached [`CommitListener`] in
/// log order; the proposer's [`ReqId`] rides only to the proposing replica.
/// [`MemReplDevice::replay`] redelivers the whole log to the local listener
/// with no commit context, which is exactly the restart path: the listener
/// must read payloads back through [`ReplDevice::async_read`].
pub struct MemReplDevice {
    log: Arc<SharedLog>,
    replica: usize,
    listener: RwLock<Option<Arc<dyn CommitListener>>>,
}

impl MemReplDevice {
    /// Create a replica group sharing one log.
    pub fn group(config: DeviceConfig) -> Vec<Arc<MemReplDevice>> {
        let (dispatch_turn, _) = watch::channel(1);
        let log = Arc::new(SharedLog {
            block_size: config.block_size,
            records: Mutex::new(Vec::new()),
            blocks: Mutex::new(HashMap::new()),
            next_chunk: AtomicU16::new(1),
            dispatch_turn,
            replicas: Mutex::new(Vec::new()),
        });

        (0..config.replicas)
            .map(|replica| Self::register(log.clone(), replica))
            .collect()
    }

    /// Add a replica to an existing group.
    ///
    /// The new replica does not see entries committed before it joined until
    /// it calls [`replay`](Self::replay).
    pub fn add_replica(self: &Arc<Self>) -> Arc<MemReplDevice> {
        let replica = self.log.replicas.lock().expect("lock poisoned").len();
        Self::register(self.log.clone(), replica)
    }

    fn register(log: Arc<SharedLog>, replica: usize) -> Arc<MemReplDevice> {
        let device = Arc::new(MemReplDevice {
            log: log.clone(),
            replica,
            listener: RwLock::new(None),
        });
        log.replicas
            .lock()
            .expect("lock poisoned")
            .push(Arc::downgrade(&device));
        device
    }

    /// Attach (or replace) this replica's commit listener.
    pub fn attach(&self, listener: Arc<dyn CommitListener>) {
        *self.listener.write().expect("lock poisoned") = Some(listener);
    }

    /// This replica's index within the group.
    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Number of committed entries in the shared log.
    pub fn committed_entries(&self) -> usize {
        self.log.records.lock().expect("lock poisoned").len()
    }

    /// Redeliver every committed entry to the local listener, in log order,
    /// with no commit context. Returns the number of entries delivered.
    pub async fn replay(self: &Arc<Self>) -> usize {
        let listener = self.listener.read().expect("lock poisoned").clone();
        let Some(listener) = listener else {
            debug!(replica = self.replica, "replay with no listener attached");
            return 0;
        };

        let records = self.log.records.lock().expect("lock poisoned").clone();
        let count = records.len();
        for record in records {
            listener
                .on_commit(
                    record.lsn,
                    record.header,
                    record.blk_ids,
                    self.clone() as Arc<dyn ReplDevice>,
                    None,
                )
                .await;
        }
        debug!(replica = self.replica, count, "replayed log");
        count
    }

    /// Deliver one committed entry to every replica, proposer last-writer
    /// context included, then open the turn for the next LSN.
    async fn dispatch(
        log: Arc<SharedLog>,
        proposer: usize,
        record: LogRecord,
        key: Bytes,
        req: Option<ReqId>,
    ) {
        let mut turn = log.dispatch_turn.subscribe();
        while *turn.borrow_and_update() < record.lsn {
            if turn.changed().await.is_err() {
                return;
            }
        }

        let replicas: Vec<Arc<MemReplDevice>> = log
            .replicas
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for device in replicas {
            let listener = device.listener.read().expect("lock poisoned").clone();
            let Some(listener) = listener else {
                debug!(
                    replica = device.replica,
                    lsn = record.lsn,
                    "no listener attached, skipping delivery"
                );
                continue;
            };
            let ctx = CommitCtx {
                payload: key.clone(),
                req: if device.replica == proposer { req } else { None },
            };
            listener
                .on_commit(
                    record.lsn,
                    record.header.clone(),
                    record.blk_ids,
                    device.clone() as Arc<dyn ReplDevice>,
                    Some(ctx),
                )
                .await;
        }

        log.dispatch_turn.send_replace(record.lsn + 1);
    }
}

#[async_trait::async_trait]
impl ReplDevice for MemReplDevice {
    fn block_size(&self) -> u64 {
        self.log.block_size
    }

    async fn async_alloc_write(
        &self,
        header: Bytes,
        key: Bytes,
        value: Bytes,
        ctx: Option<ReqId>,
    ) -> Result<Lsn, ReplError> {
        let block_size = self.log.block_size;
        if value.is_empty() || value.len() as u64 % block_size != 0 {
            return Err(ReplError::UnalignedPayload {
                len: value.len(),
                block_size,
            });
        }

        let chunk = self.log.next_chunk.fetch_add(1, Ordering::SeqCst);
        let blk_ids = BlockIds {
            chunk,
            start_blk: 0,
            blk_count: (value.len() as u64 / block_size) as u32,
        };

        let record = {
            let mut records = self.log.records.lock().expect("lock poisoned");
            let record = LogRecord {
                lsn: records.len() as Lsn + 1,
                header,
                blk_ids,
            };
            records.push(record.clone());
            record
        };
        self.log
            .blocks
            .lock()
            .expect("lock poisoned")
            .insert(blk_ids, value);

        let lsn = record.lsn;
        debug!(replica = self.replica, lsn, chunk, "committed log entry");

        // Dispatch on a detached task: a proposal already in the log commits
        // on every replica even if the proposing caller goes away.
        let handle = tokio::spawn(Self::dispatch(
            self.log.clone(),
            self.replica,
            record,
            key,
            ctx,
        ));
        let _ = handle.await;

        Ok(lsn)
    }

    async fn async_read(&self, blk_ids: BlockIds, size: u64) -> Result<Bytes, ReplError> {
        let blocks = self.log.blocks.lock().expect("lock poisoned");
        let Some(bytes) = blocks.get(&blk_ids) else {
            return Err(ReplError::UnknownBlocks(blk_ids));
        };
        if size as usize > bytes.len() {
            return Err(ReplError::UnknownBlocks(blk_ids));
        }
        Ok(bytes.slice(0..size as usize))
    }
}
