//! Clients and operation contexts
//!
//! A `Client` models one connection; it conceptually owns the sessions it
//! runs operations on. An `OperationContext` carries the per-request storage
//! and locking state the controller captures into and restores from its
//! stash: the recovery unit, the locker, the write unit marker and the read
//! concern.
//!
//! Lock ordering: code that takes both the client lock and a session mutex
//! must take the client lock first. Clients own sessions; a caller may lock
//! the client to keep it alive and then lock a session under it, and
//! deadlock-safety depends on never doing the reverse.

use crate::observer::ReplicationObserver;
use papyrus_common::{OpTime, ReadConcernArgs, TxnNumber};
use papyrus_storage::{Locker, RecoveryUnit, StorageEngine};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// One client connection
pub struct Client {
    id: u64,
    desc: String,
    app_name: String,
    connected: AtomicBool,
    /// The client lock; see the module docs for the ordering discipline
    lock: Mutex<()>,
    /// Replication-tracking op-time: the last op this client must be able
    /// to wait on for write concern
    last_op: Mutex<OpTime>,
}

impl Client {
    pub fn new(desc: impl Into<String>, app_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            desc: desc.into(),
            app_name: app_name.into(),
            connected: AtomicBool::new(true),
            lock: Mutex::new(()),
            last_op: Mutex::new(OpTime::null()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Take the client lock
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn last_op(&self) -> OpTime {
        *self.last_op.lock()
    }

    /// Advance the replication-tracking op-time; never moves backward
    pub fn advance_last_op(&self, op_time: OpTime) {
        let mut last = self.last_op.lock();
        if op_time > *last {
            *last = op_time;
        }
    }

    pub fn disconnect(&self) {
        tracing::info!(client = self.id, "closing client connection");
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Additive per-operation execution metrics, aggregated across the
/// statements of a transaction
#[derive(Debug, Default, Clone)]
pub struct AdditiveMetrics {
    pub keys_examined: u64,
    pub docs_examined: u64,
    pub docs_written: u64,
}

impl AdditiveMetrics {
    pub fn add(&mut self, other: &AdditiveMetrics) {
        self.keys_examined += other.keys_examined;
        self.docs_examined += other.docs_examined;
        self.docs_written += other.docs_written;
    }

    pub fn report(&self) -> String {
        format!(
            "keysExamined:{} docsExamined:{} docsWritten:{}",
            self.keys_examined, self.docs_examined, self.docs_written
        )
    }
}

/// Debug information about the operation currently bound to a session
#[derive(Debug, Default, Clone)]
pub struct OpDebug {
    pub additive: AdditiveMetrics,
}

/// Marker for an open write unit on an operation context. The buffered
/// writes themselves live in the recovery unit and travel with it.
pub struct WriteUnit {
    _private: (),
}

/// Per-request execution state
pub struct OperationContext {
    engine: Arc<StorageEngine>,
    client: Arc<Client>,
    observer: Arc<dyn ReplicationObserver>,
    txn_number: Option<TxnNumber>,
    recovery_unit: Box<RecoveryUnit>,
    locker: Locker,
    write_unit: Option<WriteUnit>,
    read_concern: ReadConcernArgs,
    op_debug: OpDebug,
    direct_client: bool,
}

impl OperationContext {
    pub fn new(
        engine: &Arc<StorageEngine>,
        client: Arc<Client>,
        observer: Arc<dyn ReplicationObserver>,
    ) -> Self {
        Self {
            engine: Arc::clone(engine),
            client,
            observer,
            txn_number: None,
            recovery_unit: Box::new(engine.new_recovery_unit()),
            locker: engine.new_locker(),
            write_unit: None,
            read_concern: ReadConcernArgs::default(),
            op_debug: OpDebug::default(),
            direct_client: false,
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn observer(&self) -> Arc<dyn ReplicationObserver> {
        Arc::clone(&self.observer)
    }

    pub fn txn_number(&self) -> Option<TxnNumber> {
        self.txn_number
    }

    pub fn set_txn_number(&mut self, txn_number: TxnNumber) {
        self.txn_number = Some(txn_number);
    }

    pub fn recovery_unit(&mut self) -> &mut RecoveryUnit {
        &mut self.recovery_unit
    }

    pub fn recovery_unit_ref(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    /// Take the recovery unit off this operation, installing a fresh one
    pub fn release_recovery_unit(&mut self) -> Box<RecoveryUnit> {
        let fresh = Box::new(self.engine.new_recovery_unit());
        std::mem::replace(&mut self.recovery_unit, fresh)
    }

    pub fn set_recovery_unit(&mut self, recovery_unit: Box<RecoveryUnit>) {
        self.recovery_unit = recovery_unit;
    }

    /// Install a brand-new recovery unit, dropping the current one
    pub fn replace_recovery_unit(&mut self) {
        self.recovery_unit = Box::new(self.engine.new_recovery_unit());
    }

    /// Swap the locker on this operation, returning the previous one
    pub fn swap_locker(&mut self, locker: Locker) -> Locker {
        std::mem::replace(&mut self.locker, locker)
    }

    pub fn locker(&mut self) -> &mut Locker {
        &mut self.locker
    }

    pub fn locker_ref(&self) -> &Locker {
        &self.locker
    }

    pub fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }

    pub fn set_read_concern(&mut self, read_concern: ReadConcernArgs) {
        self.read_concern = read_concern;
    }

    pub fn begin_write_unit(&mut self) {
        self.recovery_unit.begin_unit_of_work();
        self.write_unit = Some(WriteUnit { _private: () });
    }

    pub fn in_write_unit(&self) -> bool {
        self.write_unit.is_some()
    }

    /// Commit the write unit; the recovery unit applies the batch
    pub fn commit_write_unit(&mut self) -> papyrus_storage::Result<()> {
        self.write_unit = None;
        self.recovery_unit.commit_unit_of_work()
    }

    /// Drive the first phase of a two-phase commit
    pub fn prepare_write_unit(&mut self) -> papyrus_storage::Result<papyrus_common::Timestamp> {
        self.recovery_unit.prepare_unit_of_work()
    }

    /// Abort the write unit if one is open
    pub fn abort_write_unit(&mut self) {
        if self.write_unit.take().is_some() {
            self.recovery_unit.abort_unit_of_work();
        }
    }

    /// Detach the write-unit marker without touching the recovery unit;
    /// the open unit's state travels with the recovery unit itself.
    pub(crate) fn take_write_unit_marker(&mut self) -> bool {
        self.write_unit.take().is_some()
    }

    pub(crate) fn restore_write_unit_marker(&mut self, had_write_unit: bool) {
        if had_write_unit {
            self.write_unit = Some(WriteUnit { _private: () });
        }
    }

    pub fn op_debug(&self) -> &OpDebug {
        &self.op_debug
    }

    pub fn op_debug_mut(&mut self) -> &mut OpDebug {
        &mut self.op_debug
    }

    /// Mark this context as an internal (direct) client operation; the
    /// controller ignores those at its public entry points
    pub fn set_direct_client(&mut self, direct: bool) {
        self.direct_client = direct;
    }

    pub fn is_direct_client(&self) -> bool {
        self.direct_client
    }
}
