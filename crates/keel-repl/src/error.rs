//! Error types for replication devices.

use crate::device::BlockIds;

/// Errors returned by [`ReplDevice`](crate::ReplDevice) operations.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// The payload is not a whole number of device blocks.
    #[error("payload length {len} is not a multiple of device block size {block_size}")]
    UnalignedPayload {
        /// Offending payload length.
        len: usize,
        /// The device's block size.
        block_size: u64,
    },

    /// A read referenced blocks the device does not hold.
    #[error("no blocks stored at {0:?}")]
    UnknownBlocks(BlockIds),

    /// The log append could not complete.
    #[error("log append failed: {0}")]
    AppendFailed(String),
}
