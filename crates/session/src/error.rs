//! Error types for the session transaction controller

use papyrus_common::{SessionId, TxnNumber};
use papyrus_storage::StorageError;
use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by the session controller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// A newer transaction number has already started on this session
    #[error(
        "Cannot start transaction {requested} on session {session_id} because a newer \
         transaction {active} has already started"
    )]
    TransactionTooOld {
        session_id: SessionId,
        requested: TxnNumber,
        active: TxnNumber,
    },

    /// Session state changed under the operation; the caller must retry
    #[error("{0}")]
    ConflictingOperationInProgress(String),

    /// The transaction was aborted or never started
    #[error("{0}")]
    NoSuchTransaction(String),

    /// The transaction already committed; only a commit retry is accepted
    #[error("Transaction {0} has been committed")]
    TransactionCommitted(TxnNumber),

    #[error(
        "Total size of all transaction operations must be less than {limit}. \
         Actual size is {size}"
    )]
    TransactionTooLarge { size: usize, limit: usize },

    #[error("{0}")]
    InvalidOptions(String),

    #[error("{0}")]
    OperationNotSupportedInTransaction(String),

    /// The durable log no longer holds this session's full write history
    #[error("Incomplete history detected for transaction {txn_number} on session {session_id}")]
    IncompleteTransactionHistory {
        session_id: SessionId,
        txn_number: TxnNumber,
    },

    /// Raised by the post-write failpoint; the write must not be reflected
    #[error("Failing write due to an enabled failpoint (code {0})")]
    InjectedFailure(i64),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// True for the storage-level conflict the surrounding write loop
    /// recovers from by retrying at a newer snapshot.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, SessionError::Storage(StorageError::WriteConflict))
    }
}
