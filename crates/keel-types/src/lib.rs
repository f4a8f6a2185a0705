//! Shared types and identifiers for Keel.
//!
//! This crate defines the core types used across the Keel workspace:
//! identifiers ([`PgId`], [`ShardId`], [`ChunkId`], [`Lsn`]), the shard
//! metadata record ([`ShardInfo`] and [`ShardState`]), and the monotonic
//! wall clock ([`MonotonicClock`]) that stamps shard timestamps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Placement-group identifier. A PG is a replication unit: a fixed set of
/// nodes jointly replicating a slice of the object namespace via a shared log.
pub type PgId = u16;

/// Identifier of a raw storage chunk managed by the chunk selector.
pub type ChunkId = u16;

/// Log sequence number assigned by the replication device to each committed
/// entry.
pub type Lsn = u64;

/// Number of low bits of a [`ShardId`] that carry the per-PG sequence.
///
/// Shared by all replicas; its value fixes the maximum number of shards a
/// single PG can ever allocate (`1 << SHARD_WIDTH`).
pub const SHARD_WIDTH: u32 = 48;

/// Composite shard identifier: high bits are the owning [`PgId`], the low
/// [`SHARD_WIDTH`] bits are a per-PG monotonic sequence. Sequence 0 is
/// reserved and never allocated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u64);

impl ShardId {
    /// Compose an ID from a PG and a per-PG sequence number.
    pub fn new(pg_id: PgId, seq: u64) -> Self {
        debug_assert!(seq < (1u64 << SHARD_WIDTH));
        Self(((pg_id as u64) << SHARD_WIDTH) | seq)
    }

    /// The owning placement group (high bits).
    pub fn pg_id(&self) -> PgId {
        (self.0 >> SHARD_WIDTH) as PgId
    }

    /// The per-PG sequence (low [`SHARD_WIDTH`] bits).
    pub fn seq(&self) -> u64 {
        self.0 & ((1u64 << SHARD_WIDTH) - 1)
    }

    /// Raw 64-bit representation.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Big-endian byte representation, used as a durable store key so that
    /// lexicographic ordering matches numeric ordering.
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl From<u64> for ShardId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pg_id(), self.seq())
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({self})")
    }
}

// ---------------------------------------------------------------------------
// Shard metadata
// ---------------------------------------------------------------------------

/// Lifecycle state of a shard. `Sealed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    /// Accepting object writes.
    Open,
    /// Immutable; capacity returned to the chunk pool.
    Sealed,
}

/// The logical shard record replicated through the PG log and persisted in
/// the shard superblock.
///
/// Invariants: `available_capacity_bytes <= total_capacity_bytes`,
/// `deleted_capacity_bytes <= total_capacity_bytes`,
/// `last_modified_time >= created_time`, and a `Sealed` shard never goes
/// back to `Open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Composite identifier (PG + per-PG sequence).
    pub id: ShardId,
    /// The owning placement group.
    pub placement_group: PgId,
    /// Lifecycle state.
    pub state: ShardState,
    /// Creation time: monotonic wallclock microseconds at the origin replica.
    pub created_time: u64,
    /// Last modification time, same clock domain as `created_time`.
    pub last_modified_time: u64,
    /// Capacity reserved at CREATE; fixed for the shard's lifetime.
    pub total_capacity_bytes: u64,
    /// Capacity still available for ingest.
    pub available_capacity_bytes: u64,
    /// Capacity occupied by deleted objects, reclaimable only by sealing.
    pub deleted_capacity_bytes: u64,
}

// ---------------------------------------------------------------------------
// Monotonic wall clock
// ---------------------------------------------------------------------------

/// A monotonic wall clock producing microsecond timestamps.
///
/// Returned values are always at least the wall-clock time and strictly
/// increasing across calls, even when the wall clock stalls or retreats.
/// Thread-safe via `AtomicU64`.
pub struct MonotonicClock {
    last: AtomicU64,
}

impl MonotonicClock {
    /// Create a clock initialised to the current wall-clock time.
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(wall_clock_micros()),
        }
    }

    /// Advance and return a new unique timestamp in microseconds.
    pub fn tick(&self) -> u64 {
        loop {
            let prev = self.last.load(Ordering::SeqCst);
            let now = wall_clock_micros();
            let candidate = prev.max(now) + 1;

            if self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Current clock value without advancing it.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("last", &self.last.load(Ordering::SeqCst))
            .finish()
    }
}

/// Current wall-clock time in microseconds since UNIX epoch.
fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
