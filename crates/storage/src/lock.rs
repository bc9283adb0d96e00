//! Lock manager: global intent locks, tickets, thread ownership
//!
//! A `Locker` is the lock-manager handle bound to one operation. It owns a
//! concurrency ticket, a set of global lock grants and an optional
//! per-request timeout. Transactions hand lockers between threads across
//! network request boundaries, so lockers support releasing their ticket and
//! unbinding from the owning thread while parked.

use crate::engine::StorageEngine;
use crate::error::{Result, StorageError};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Global lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    /// Standard multigranularity compatibility matrix
    pub fn is_compatible_with(&self, other: LockMode) -> bool {
        use LockMode::*;
        match (*self, other) {
            (IntentShared, IntentShared)
            | (IntentShared, IntentExclusive)
            | (IntentShared, Shared)
            | (IntentExclusive, IntentShared)
            | (IntentExclusive, IntentExclusive)
            | (Shared, IntentShared)
            | (Shared, Shared) => true,
            _ => false,
        }
    }
}

/// Whether a locker currently holds any resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Inactive,
    Active,
}

/// Snapshot of a locker's holdings, for reporting
#[derive(Debug, Clone, Serialize)]
pub struct LockerInfo {
    pub modes_held: Vec<LockMode>,
    pub ticket_held: bool,
}

/// Aggregate table of granted global locks, keyed by locker id
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    grants: Vec<(u64, LockMode)>,
}

impl LockTable {
    fn can_grant(&self, locker_id: u64, mode: LockMode) -> bool {
        self.grants
            .iter()
            .filter(|(id, _)| *id != locker_id)
            .all(|(_, held)| mode.is_compatible_with(*held))
    }

    fn grant(&mut self, locker_id: u64, mode: LockMode) {
        self.grants.push((locker_id, mode));
    }

    fn release_one(&mut self, locker_id: u64, mode: LockMode) {
        if let Some(pos) = self
            .grants
            .iter()
            .position(|(id, m)| *id == locker_id && *m == mode)
        {
            self.grants.remove(pos);
        }
    }

    fn release_all(&mut self, locker_id: u64) {
        self.grants.retain(|(id, _)| *id != locker_id);
    }
}

/// Bounded pool of concurrency tickets
#[derive(Debug)]
pub(crate) struct TicketHolder {
    available: Mutex<u32>,
    cv: Condvar,
}

impl TicketHolder {
    pub(crate) fn new(size: u32) -> Self {
        Self {
            available: Mutex::new(size),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self, timeout: Option<Duration>) -> Result<()> {
        let mut available = self.available.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        while *available == 0 {
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut available, deadline).timed_out() {
                        return Err(StorageError::TicketTimeout);
                    }
                }
                None => self.cv.wait(&mut available),
            }
        }
        *available -= 1;
        Ok(())
    }

    fn release(&self) {
        *self.available.lock() += 1;
        self.cv.notify_one();
    }
}

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

/// Lock-manager handle bound to one operation
pub struct Locker {
    engine: Arc<StorageEngine>,
    id: u64,
    ticket_held: bool,
    granted: Vec<LockMode>,
    max_lock_timeout: Option<Duration>,
    thread: Option<ThreadId>,
}

impl Locker {
    pub(crate) fn new(engine: Arc<StorageEngine>) -> Self {
        Self {
            engine,
            id: NEXT_LOCKER_ID.fetch_add(1, Ordering::Relaxed),
            ticket_held: false,
            granted: Vec::new(),
            max_lock_timeout: None,
            thread: Some(std::thread::current().id()),
        }
    }

    /// Acquire the global lock in `mode`, taking a ticket first if this
    /// locker does not hold one. Waits up to the configured per-request
    /// timeout, or indefinitely when none is set.
    pub fn lock_global(&mut self, mode: LockMode) -> Result<()> {
        if !self.ticket_held {
            self.engine.tickets().acquire(self.max_lock_timeout)?;
            self.ticket_held = true;
        }

        // Grants are recursive: repeated acquisitions of the same mode
        // stack and must be released pairwise.

        let (table, cv) = self.engine.lock_table();
        let mut table = table.lock();
        let deadline = self.max_lock_timeout.map(|t| Instant::now() + t);
        while !table.can_grant(self.id, mode) {
            match deadline {
                Some(deadline) => {
                    if cv.wait_until(&mut table, deadline).timed_out() {
                        tracing::warn!(?mode, "global lock request timed out");
                        return Err(StorageError::LockTimeout(
                            self.max_lock_timeout.unwrap_or_default(),
                        ));
                    }
                }
                None => cv.wait(&mut table),
            }
        }
        table.grant(self.id, mode);
        self.granted.push(mode);
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        !self.granted.is_empty()
    }

    /// Release one grant of `mode`, the pair of an earlier `lock_global`
    pub fn unlock_global(&mut self, mode: LockMode) {
        if let Some(pos) = self.granted.iter().position(|m| *m == mode) {
            self.granted.remove(pos);
            let (table, cv) = self.engine.lock_table();
            table.lock().release_one(self.id, mode);
            cv.notify_all();
        }
    }

    /// Return the concurrency ticket while this locker is parked in a stash
    pub fn release_ticket(&mut self) {
        if self.ticket_held {
            self.engine.tickets().release();
            self.ticket_held = false;
        }
    }

    /// Take a ticket back before the locker is restored onto an operation
    pub fn reacquire_ticket(&mut self) -> Result<()> {
        if !self.ticket_held {
            self.engine.tickets().acquire(self.max_lock_timeout)?;
            self.ticket_held = true;
        }
        Ok(())
    }

    pub fn set_max_lock_timeout(&mut self, timeout: Duration) {
        self.max_lock_timeout = Some(timeout);
    }

    pub fn unset_max_lock_timeout(&mut self) {
        self.max_lock_timeout = None;
    }

    /// Detach from the owning thread while stashed
    pub fn unset_thread(&mut self) {
        self.thread = None;
    }

    /// Bind to the thread currently driving the operation
    pub fn bind_to_current_thread(&mut self) {
        self.thread = Some(std::thread::current().id());
    }

    /// True when the locker is bound to the calling thread
    pub fn is_bound_to_current_thread(&self) -> bool {
        self.thread == Some(std::thread::current().id())
    }

    pub fn client_state(&self) -> ClientState {
        if self.granted.is_empty() && !self.ticket_held {
            ClientState::Inactive
        } else {
            ClientState::Active
        }
    }

    /// Holdings snapshot; `None` when the locker holds nothing
    pub fn info(&self) -> Option<LockerInfo> {
        if self.granted.is_empty() {
            return None;
        }
        Some(LockerInfo {
            modes_held: self.granted.clone(),
            ticket_held: self.ticket_held,
        })
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        if !self.granted.is_empty() {
            let (table, cv) = self.engine.lock_table();
            table.lock().release_all(self.id);
            cv.notify_all();
            self.granted.clear();
        }
        self.release_ticket();
    }
}
