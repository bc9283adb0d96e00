//! Error types for the storage engine

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur inside the storage engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A concurrent writer committed to the same key after this unit's
    /// snapshot. The caller retries the whole unit at a newer snapshot.
    #[error("Write conflict: operation must retry at a newer snapshot")]
    WriteConflict,

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Collection missing: {0}")]
    CollectionMissing(String),

    /// The durable log chain crosses the truncation point.
    #[error("Transaction history is incomplete: the durable log was truncated")]
    IncompleteHistory,

    #[error("Lock acquisition timed out after {0:?}")]
    LockTimeout(std::time::Duration),

    #[error("Could not acquire a concurrency ticket")]
    TicketTimeout,

    #[error("Storage corruption: {0}")]
    Corruption(String),
}
