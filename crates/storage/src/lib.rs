//! In-memory storage engine for the papyrus session transaction subsystem
//!
//! This crate provides the storage collaborator the session controller
//! drives:
//! - Versioned collections with snapshot reads and first-updater-wins
//!   conflict detection
//! - Recovery units: one pinned snapshot each, buffered two-phase units of
//!   work, commit-timestamp binding and commit hooks
//! - A lock manager with global intent locks, concurrency tickets,
//!   per-request timeouts and thread ownership handoff
//! - The durable replication log with backward per-session chaining and
//!   truncation
//!
//! Everything lives in memory. The concurrency semantics (snapshot
//! isolation, write conflicts, lock compatibility, ticket exhaustion) are
//! real; only the persistence medium is simulated.

pub mod collection;
pub mod engine;
pub mod error;
pub mod lock;
pub mod oplog;
pub mod recovery_unit;

pub use engine::{StorageConfig, StorageEngine, SESSION_RECORDS_COLLECTION};
pub use error::{Result, StorageError};
pub use lock::{ClientState, LockMode, Locker, LockerInfo};
pub use oplog::{OplogChainIterator, OplogEntry};
pub use recovery_unit::{ReadSource, RecoveryUnit};
