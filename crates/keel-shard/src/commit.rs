//! The committer: applies committed log entries on every replica.
//!
//! [`ShardManager`] is the [`CommitListener`] of each PG's replication
//! device. Entries arrive in log order, both in steady state and during
//! restart replay; apply is idempotent so the two paths share all code
//! past payload fetch.

use std::sync::Arc;

use bytes::Bytes;
use keel_repl::{BlockIds, CommitCtx, CommitListener, ReplDevice, ReqId};
use keel_types::{Lsn, ShardInfo, ShardState};
use tracing::warn;

use crate::codec::{self, MessageHeader, MessageType};
use crate::directory::ShardEntry;
use crate::error::ShardError;
use crate::manager::ShardManager;
use crate::superblock::ShardSuperblock;

#[async_trait::async_trait]
impl CommitListener for ShardManager {
    async fn on_commit(
        &self,
        lsn: Lsn,
        header: Bytes,
        blk_ids: BlockIds,
        device: Arc<dyn ReplDevice>,
        ctx: Option<CommitCtx>,
    ) {
        let header = match MessageHeader::decode(&header) {
            Ok(header) => header,
            Err(e) => {
                warn!(lsn, %e, "undecodable replication header, skipping entry");
                if let Some(ctx) = &ctx {
                    self.resolve_request(ctx.req, Err(ShardError::CrcMismatch));
                }
                return;
            }
        };

        match ctx {
            // Live commit: the payload rode along as the entry's key blob.
            Some(ctx) => self.apply(lsn, header, blk_ids, &ctx.payload, ctx.req),
            // Restart replay: the payload lives only in the data blocks.
            None => match device.async_read(blk_ids, header.payload_size as u64).await {
                Ok(payload) => self.apply(lsn, header, blk_ids, &payload, None),
                Err(e) => {
                    // If the superblock made it to disk before the crash it
                    // was recovered already; otherwise the log still holds
                    // the entry and the next replay will retry.
                    warn!(lsn, %e, "failed to read payload during replay, skipping entry");
                }
            },
        }
    }
}

impl ShardManager {
    /// Verify and apply one committed entry, then notify the proposer if
    /// this replica carries its request handle.
    fn apply(
        &self,
        lsn: Lsn,
        header: MessageHeader,
        blk_ids: BlockIds,
        payload: &[u8],
        req: Option<ReqId>,
    ) {
        if header.corrupted() {
            warn!(lsn, "replication header crc mismatch, skipping entry");
            self.resolve_request(req, Err(ShardError::CrcMismatch));
            return;
        }
        if codec::crc32(payload) != header.payload_crc {
            warn!(lsn, "payload disagrees with header crc, skipping entry");
            self.resolve_request(req, Err(ShardError::CrcMismatch));
            return;
        }

        let info = match codec::decode_shard_info(payload) {
            Ok(info) => info,
            Err(e) => {
                warn!(lsn, %e, "undecodable shard payload, skipping entry");
                self.resolve_request(req, Err(ShardError::CrcMismatch));
                return;
            }
        };

        match header.msg_type {
            MessageType::CreateShard => self.apply_create(&info, blk_ids),
            MessageType::SealShard => self.apply_seal(&info),
        }

        self.resolve_request(req, Ok(info));
    }

    /// Materialise a committed CREATE: superblock first, then both indices,
    /// then the chunk binding.
    fn apply_create(&self, info: &ShardInfo, blk_ids: BlockIds) {
        if self.directory.contains_shard(info.id) {
            // Already materialised (the superblock was recovered before this
            // replay); only make sure the sequence covers it.
            self.directory
                .catch_up_sequence(info.placement_group, info.id.seq());
            return;
        }

        let chunk_id = blk_ids.chunk_num();
        ShardSuperblock::new(info.clone(), chunk_id)
            .write(&self.superblocks)
            .expect("superblock write must not fail");
        self.directory.insert_shard(ShardEntry {
            info: info.clone(),
            chunk_id,
        });
        // A no-op in steady state (the device marked the chunk busy when it
        // allocated the blocks); during replay this rebuilds the busy set.
        self.chunk_selector.select_specific_chunk(chunk_id);
    }

    /// Apply a committed SEAL: release the chunk and persist the sealed
    /// record. Sealing an already sealed shard is a no-op.
    fn apply_seal(&self, info: &ShardInfo) {
        debug_assert_eq!(info.state, ShardState::Sealed);

        let state = self
            .directory
            .shard_state(info.id)
            .unwrap_or_else(|| panic!("seal committed for unknown shard {}", info.id));
        if state != ShardState::Open {
            return;
        }

        let chunk_id = self
            .directory
            .get_shard_chunk(info.id)
            .unwrap_or_else(|| panic!("no chunk bound to shard {}", info.id));
        self.chunk_selector.release_chunk(chunk_id);
        self.directory.update_shard(info.clone());
        ShardSuperblock::new(info.clone(), chunk_id)
            .write(&self.superblocks)
            .expect("superblock write must not fail");
    }
}
