//! The storage engine facade
//!
//! Owns the versioned collections, the durable replication log, the global
//! lock table and the concurrency ticket pool, and hands out recovery units
//! and lockers. A single logical clock stamps commits, prepares and log
//! appends, so snapshots and op-times are totally ordered against each
//! other.

use crate::collection::Collection;
use crate::error::{Result, StorageError};
use crate::lock::{LockTable, Locker, TicketHolder};
use crate::oplog::{Oplog, OplogEntry};
use crate::recovery_unit::{PendingWrite, ReadSource, RecoveryUnit};
use papyrus_common::{OpTime, Timestamp};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Collection holding the durable per-session transaction records
pub const SESSION_RECORDS_COLLECTION: &str = "system.session_records";

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Size of the concurrency ticket pool
    pub ticket_pool_size: u32,

    /// Whether to create the session-records collection at startup
    pub create_session_records: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            ticket_pool_size: 128,
            create_session_records: true,
        }
    }
}

impl StorageConfig {
    /// Set the ticket pool size
    pub fn with_ticket_pool_size(mut self, size: u32) -> Self {
        self.ticket_pool_size = size;
        self
    }

    /// Control creation of the session-records collection
    pub fn with_session_records(mut self, create: bool) -> Self {
        self.create_session_records = create;
        self
    }
}

#[derive(Default)]
struct EngineState {
    collections: HashMap<String, Collection>,
    /// Logical clock; strictly increasing across ticks
    clock: Timestamp,
    /// Position the replication subsystem has applied through
    last_applied: Timestamp,
    oplog: Oplog,
}

impl EngineState {
    fn tick(&mut self) -> Timestamp {
        let now = Timestamp::now();
        self.clock = if now > self.clock {
            now
        } else {
            self.clock.add_micros(1)
        };
        self.clock
    }

    fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| StorageError::CollectionMissing(name.to_string()))
    }
}

/// The engine itself; shared via `Arc`
pub struct StorageEngine {
    state: Mutex<EngineState>,
    lock_table: Mutex<LockTable>,
    lock_cv: Condvar,
    tickets: TicketHolder,
    term: AtomicU64,
    snapshot_ids: AtomicU64,
}

impl StorageEngine {
    pub fn new(config: StorageConfig) -> Arc<Self> {
        let mut state = EngineState::default();
        state.clock = Timestamp::now();
        state.last_applied = state.clock;
        if config.create_session_records {
            state
                .collections
                .insert(SESSION_RECORDS_COLLECTION.to_string(), Collection::new());
        }

        Arc::new(Self {
            state: Mutex::new(state),
            lock_table: Mutex::new(LockTable::default()),
            lock_cv: Condvar::new(),
            tickets: TicketHolder::new(config.ticket_pool_size),
            term: AtomicU64::new(1),
            snapshot_ids: AtomicU64::new(1),
        })
    }

    pub fn new_recovery_unit(self: &Arc<Self>) -> RecoveryUnit {
        RecoveryUnit::new(Arc::clone(self))
    }

    pub fn new_locker(self: &Arc<Self>) -> Locker {
        Locker::new(Arc::clone(self))
    }

    pub fn create_collection(&self, name: &str) {
        self.state
            .lock()
            .collections
            .entry(name.to_string())
            .or_insert_with(Collection::new);
    }

    pub fn drop_collection(&self, name: &str) {
        self.state.lock().collections.remove(name);
    }

    pub fn collection_exists(&self, name: &str) -> bool {
        self.state.lock().collections.contains_key(name)
    }

    /// Append an entry to the durable log, assigning its op-time
    pub fn append_oplog(&self, mut entry: OplogEntry) -> OpTime {
        let mut state = self.state.lock();
        let ts = state.tick();
        let op_time = OpTime::new(ts, self.current_term());
        entry.op_time = op_time;
        state.last_applied = ts;
        state.oplog.insert(entry);
        op_time
    }

    /// Drop log entries before `op_time`, modeling history truncation
    pub fn truncate_oplog_before(&self, op_time: OpTime) {
        tracing::info!(%op_time, "truncating oplog history");
        self.state.lock().oplog.truncate_before(op_time);
    }

    pub(crate) fn oplog_entry(&self, op_time: OpTime) -> Result<OplogEntry> {
        self.state.lock().oplog.get(op_time)
    }

    /// Current replication election term
    pub fn current_term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::SeqCst);
    }

    /// Timestamp the replication subsystem has applied through
    pub fn last_applied(&self) -> Timestamp {
        self.state.lock().last_applied
    }

    // === Recovery unit support ===

    pub(crate) fn snapshot_for(&self, source: ReadSource) -> Timestamp {
        let state = self.state.lock();
        match source {
            ReadSource::Latest => state.clock,
            ReadSource::LastApplied => state.last_applied,
            ReadSource::Provided(ts) => ts,
        }
    }

    pub(crate) fn next_snapshot_id(&self) -> u64 {
        self.snapshot_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn tick(&self) -> Timestamp {
        self.state.lock().tick()
    }

    pub(crate) fn read_at(
        &self,
        collection: &str,
        key: &[u8],
        snapshot: Timestamp,
    ) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        Ok(state.collection(collection)?.read_at(key, snapshot))
    }

    pub(crate) fn check_insertable(
        &self,
        collection: &str,
        key: &[u8],
        snapshot: Timestamp,
    ) -> Result<()> {
        let state = self.state.lock();
        let col = state.collection(collection)?;
        if let Some(latest) = col.latest(key) {
            if latest.value.is_some() {
                return Err(StorageError::DuplicateKey(format!(
                    "{}: key already exists",
                    collection
                )));
            }
            if latest.version > snapshot {
                return Err(StorageError::WriteConflict);
            }
        }
        Ok(())
    }

    pub(crate) fn check_updatable(
        &self,
        collection: &str,
        key: &[u8],
        snapshot: Timestamp,
    ) -> Result<()> {
        let state = self.state.lock();
        let col = state.collection(collection)?;
        if let Some(latest) = col.latest(key) {
            if latest.version > snapshot {
                return Err(StorageError::WriteConflict);
            }
        }
        Ok(())
    }

    /// Validate and apply one unit's buffered writes atomically.
    /// First-committer-wins: any key committed past `snapshot` by another
    /// unit fails the whole batch with `WriteConflict`.
    pub(crate) fn commit_writes(
        &self,
        pending: &[PendingWrite],
        commit_ts: Option<Timestamp>,
        snapshot: Option<Timestamp>,
    ) -> Result<Timestamp> {
        let mut state = self.state.lock();

        if let Some(snapshot) = snapshot {
            for write in pending {
                let col = state.collection(&write.collection)?;
                if let Some(latest) = col.latest(&write.key) {
                    if latest.version > snapshot {
                        return Err(StorageError::WriteConflict);
                    }
                }
            }
        }

        let version = match commit_ts {
            Some(ts) => {
                if ts > state.clock {
                    state.clock = ts;
                }
                ts
            }
            None => state.tick(),
        };

        for write in pending {
            state
                .collections
                .get_mut(&write.collection)
                .ok_or_else(|| StorageError::CollectionMissing(write.collection.clone()))?
                .apply(write.key.clone(), write.value.clone(), version);
        }

        Ok(version)
    }

    // === Lock manager support ===

    pub(crate) fn tickets(&self) -> &TicketHolder {
        &self.tickets
    }

    pub(crate) fn lock_table(&self) -> (&Mutex<LockTable>, &Condvar) {
        (&self.lock_table, &self.lock_cv)
    }
}
