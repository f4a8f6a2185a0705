//! Error types for the shard manager.

use keel_repl::ReplError;
use keel_types::PgId;

/// Errors surfaced to shard-manager callers.
///
/// All variants are recoverable from the caller's perspective; retrying is
/// legal. Broken replicated-log invariants (a committed SEAL for a shard
/// that was never created, a duplicate shard insertion, an exhausted per-PG
/// sequence space) are not errors — they abort the process.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// The placement group is not known to this replica.
    #[error("unknown placement group {0}")]
    UnknownPg(PgId),

    /// The placement group exists but has no replication device yet.
    #[error("placement group {0} has no replication device")]
    PgNotReady(PgId),

    /// Header or payload corruption detected at commit time.
    #[error("crc mismatch in committed entry")]
    CrcMismatch,

    /// The replication device rejected the proposal.
    #[error("replication error: {0}")]
    Repl(#[from] ReplError),

    /// The commit notification channel closed before a result arrived.
    #[error("commit notification dropped before resolution")]
    NotificationLost,
}
