//! Error types for the superblock store.

/// Errors returned by [`SuperblockStore`](crate::SuperblockStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored blob does not have the expected shape.
    #[error("corrupt data: {0}")]
    CorruptData(String),
}
