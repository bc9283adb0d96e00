//! Per-session transaction controller for the papyrus document database
//!
//! This crate owns, for each logical client session, the lifecycle of
//! multi-statement transactions and retryable single-statement writes.
//!
//! ## Architecture
//!
//! The controller orchestrates five cooperating pieces:
//! - The transition table: a pure validator of the transaction state
//!   machine, with a relaxed mode used only when rehydrating from the
//!   durable log
//! - Transaction resources: the opaque bundle of storage and locking state
//!   parked in the session's stash slot between network requests
//! - Transaction history: a read-only reconstruction of a session's state
//!   from its durable record and oplog chain
//! - The durable session record writer: an idempotent upsert with
//!   write-conflict detection against concurrent writers
//! - The session controller itself: admission, stash/unstash, prepare and
//!   commit, refresh after invalidation, statement-id idempotency, aborts
//!   and statistics
//!
//! ## Concurrency
//!
//! One mutex per session guards all mutable state. The replication
//! observer and history fetches run with that mutex released and the
//! controller re-validates on re-entry. Paths that also mutate the bound
//! operation take the client lock first.

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod failpoint;
pub mod history;
pub mod metrics;
pub mod observer;
pub mod record;
pub mod stats;
pub mod transition;

mod resources;

pub use config::SessionConfig;
pub use context::{AdditiveMetrics, Client, OpDebug, OperationContext};
pub use controller::SessionController;
pub use error::{Result, SessionError};
pub use failpoint::{FailPoint, HANG_AFTER_PREALLOCATE_SNAPSHOT, ON_PRIMARY_TRANSACTIONAL_WRITE};
pub use history::{dead_end_sentinel, fetch_active_transaction_history, ActiveTransactionHistory};
pub use metrics::{RetryableWritesStats, TransactionsMetrics};
pub use observer::{NoopReplicationObserver, ReplicationObserver};
pub use record::{update_session_record, SessionRecord};
pub use stats::{LastClientInfo, SingleTransactionStats};
pub use transition::{TransitionValidation, TxnState};
