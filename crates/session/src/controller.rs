//! The per-session transaction controller
//!
//! One `SessionController` owns, for a single logical client session, the
//! lifecycle of multi-statement transactions and retryable single-statement
//! writes: admitting operations against the session's transaction number
//! and state, binding them to a consistent storage snapshot, parking and
//! restoring per-transaction resources across network request boundaries,
//! driving two-phase and one-phase commit with the replication observer,
//! enforcing statement-id idempotency and keeping the durable session
//! record current.
//!
//! A single mutex guards all mutable state. The replication observer and
//! the transaction-history fetch run with that mutex released, and the
//! controller re-validates the active transaction on re-entry. Code paths
//! that also mutate the bound operation take the client lock before the
//! session mutex (see the `context` module docs).

use crate::config::SessionConfig;
use crate::context::OperationContext;
use crate::error::{Result, SessionError};
use crate::failpoint::{HANG_AFTER_PREALLOCATE_SNAPSHOT, ON_PRIMARY_TRANSACTIONAL_WRITE};
use crate::history::{fatal_on_repeated_execution, fetch_active_transaction_history};
use crate::metrics::{RetryableWritesStats, TransactionsMetrics};
use crate::record::{update_session_record, SessionRecord};
use crate::resources::TxnResources;
use crate::stats::SingleTransactionStats;
use crate::transition::{TransitionTable, TransitionValidation, TxnState};
use papyrus_common::{
    fatal_invariant, OpTime, ReadConcernArgs, ReadConcernLevel, ReplOperation, SessionId, StmtId,
    Timestamp, TxnNumber, MAX_TRANSACTION_SIZE_BYTES,
};
use papyrus_storage::{
    LockMode, LockerInfo, OplogChainIterator, OplogEntry, ReadSource, StorageEngine,
};
use parking_lot::{Mutex, MutexGuard};
use serde_json::json;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Commands that may run inside a multi-statement transaction
const TXN_CMD_ALLOWLIST: [&str; 15] = [
    "abortTransaction",
    "aggregate",
    "commitTransaction",
    "coordinateCommitTransaction",
    "delete",
    "distinct",
    "find",
    "findAndModify",
    "findandmodify",
    "geoSearch",
    "getMore",
    "insert",
    "killCursors",
    "prepareTransaction",
    "update",
];

/// Additionally allowed when test commands are enabled
const TXN_CMD_TEST_ALLOWLIST: [&str; 1] = ["dbHash"];

/// Commands that may run against the `admin` database in a transaction
const TXN_ADMIN_COMMANDS: [&str; 4] = [
    "abortTransaction",
    "commitTransaction",
    "coordinateCommitTransaction",
    "prepareTransaction",
];

/// Mutable state, all guarded by the controller's single mutex
struct ControllerInner {
    /// False after an external invalidation until a refresh repopulates
    /// state from storage
    valid: bool,

    /// Incremented on every invalidation; lets the refresh loop detect a
    /// concurrent invalidation racing its unlocked history fetch
    num_invalidations: u64,

    /// Cached copy of the session's durable record
    last_written_record: Option<SessionRecord>,

    /// Highest transaction number this session has seen; never decreases
    active_txn_number: TxnNumber,

    /// Statement id to the op-time of its committed write. A statement in
    /// this map is persisted and must never re-execute.
    committed_statements: HashMap<StmtId, OpTime>,

    has_incomplete_history: bool,

    txn_state: TransitionTable,

    /// False only inside a multi-statement transaction
    autocommit: bool,

    /// Parked resources of an in-flight transaction between requests
    txn_resource_stash: Option<TxnResources>,

    /// Replication operations buffered while the transaction is in
    /// progress, and their cumulative serialized size
    transaction_operations: Vec<ReplOperation>,
    transaction_operation_bytes: usize,

    /// Stats for the current multi-statement transaction
    txn_stats: Option<SingleTransactionStats>,

    transaction_expire_date: Option<Timestamp>,

    /// Read timestamp the transaction's snapshot was established at,
    /// combined with the election term
    speculative_read_op_time: OpTime,
}

/// The per-session transaction controller
pub struct SessionController {
    session_id: SessionId,
    engine: Arc<StorageEngine>,
    config: Arc<SessionConfig>,
    metrics: Arc<TransactionsMetrics>,
    retryable_stats: Arc<RetryableWritesStats>,
    inner: Mutex<ControllerInner>,
}

impl SessionController {
    pub fn new(
        session_id: SessionId,
        engine: Arc<StorageEngine>,
        config: Arc<SessionConfig>,
        metrics: Arc<TransactionsMetrics>,
        retryable_stats: Arc<RetryableWritesStats>,
    ) -> Self {
        Self {
            session_id,
            engine,
            config,
            metrics,
            retryable_stats,
            inner: Mutex::new(ControllerInner {
                valid: false,
                num_invalidations: 0,
                last_written_record: None,
                active_txn_number: TxnNumber::UNINITIALIZED,
                committed_statements: HashMap::new(),
                has_incomplete_history: false,
                txn_state: TransitionTable::new(),
                autocommit: true,
                txn_resource_stash: None,
                transaction_operations: Vec::new(),
                transaction_operation_bytes: 0,
                txn_stats: None,
                transaction_expire_date: None,
                speculative_read_op_time: OpTime::null(),
            }),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    // === Queries ===

    pub fn state(&self) -> TxnState {
        self.inner.lock().txn_state.state()
    }

    pub fn active_txn_number(&self) -> TxnNumber {
        self.inner.lock().active_txn_number
    }

    pub fn in_multi_document_transaction(&self) -> bool {
        self.inner.lock().txn_state.in_multi_document_transaction()
    }

    pub fn transaction_is_committed(&self) -> bool {
        self.inner.lock().txn_state.is_committed()
    }

    pub fn transaction_is_aborted(&self) -> bool {
        self.inner.lock().txn_state.is_aborted()
    }

    pub fn has_stashed_resources(&self) -> bool {
        self.inner.lock().txn_resource_stash.is_some()
    }

    pub fn transaction_expire_date(&self) -> Option<Timestamp> {
        self.inner.lock().transaction_expire_date
    }

    pub fn speculative_read_op_time(&self) -> OpTime {
        self.inner.lock().speculative_read_op_time
    }

    // === Refresh and invalidation ===

    /// Repopulate session state from the durable log if an invalidation has
    /// made it stale. History reads are I/O and run without the session
    /// mutex; the invalidation counter detects a racing invalidation, in
    /// which case the loop restarts rather than publish stale data.
    pub fn refresh_from_storage_if_needed(&self, op: &mut OperationContext) -> Result<()> {
        if op.is_direct_client() {
            return Ok(());
        }
        assert!(
            !op.locker_ref().is_locked(),
            "cannot refresh session state while holding locks"
        );

        let mut inner = self.inner.lock();
        while !inner.valid {
            let num_invalidations = inner.num_invalidations;
            drop(inner);

            let history = fetch_active_transaction_history(&self.engine, self.session_id)?;

            inner = self.inner.lock();
            if !inner.valid && inner.num_invalidations == num_invalidations {
                inner.valid = true;

                if let Some(record) = history.last_record.as_ref() {
                    inner.active_txn_number = record.txn_number;
                    inner.committed_statements = history.committed_statements;
                    inner.has_incomplete_history = history.has_incomplete_history;
                    if history.transaction_committed {
                        // The durable log only shows the end state; relax
                        // validation rather than widen the transition table
                        // for every other caller.
                        inner
                            .txn_state
                            .transition_to(TxnState::Committed, TransitionValidation::Relaxed);
                    }
                }
                inner.last_written_record = history.last_record;
                break;
            }
        }
        Ok(())
    }

    /// Mark the session's cached state unusable after an external event
    /// (migration, session kill). Most operations are refused until a
    /// refresh repopulates state from storage.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock();
        tracing::debug!(session = %self.session_id, "invalidating session");
        inner.valid = false;
        inner.num_invalidations += 1;

        inner.last_written_record = None;

        inner.active_txn_number = TxnNumber::UNINITIALIZED;
        inner.committed_statements.clear();
        inner.speculative_read_op_time = OpTime::null();
        inner.has_incomplete_history = false;
    }

    // === Admission ===

    /// Admit an operation carrying `txn_number` onto this session, starting
    /// a new transaction or retryable write when the number is higher than
    /// the active one.
    pub fn begin_or_continue(
        &self,
        op: &mut OperationContext,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
        start_transaction: Option<bool>,
        db_name: &str,
        cmd_name: &str,
    ) -> Result<()> {
        if op.is_direct_client() {
            return Ok(());
        }
        assert!(
            !op.locker_ref().is_locked(),
            "cannot begin a transaction while holding locks"
        );

        self.refresh_from_storage_if_needed(op)?;

        // Command and database restrictions only bind multi-statement
        // transactions, which announce themselves with 'autocommit'.
        if autocommit.is_some() {
            if cmd_name == "count" && !self.config.count_in_transactions_allowed() {
                return Err(SessionError::OperationNotSupportedInTransaction(
                    "Cannot run 'count' in a multi-statement transaction.".to_string(),
                ));
            }
            let allowed = TXN_CMD_ALLOWLIST.contains(&cmd_name)
                || (self.config.test_commands_enabled()
                    && TXN_CMD_TEST_ALLOWLIST.contains(&cmd_name));
            if !allowed {
                return Err(SessionError::OperationNotSupportedInTransaction(format!(
                    "Cannot run '{}' in a multi-statement transaction.",
                    cmd_name
                )));
            }
            let db_allowed = db_name != "config"
                && db_name != "local"
                && (db_name != "admin" || TXN_ADMIN_COMMANDS.contains(&cmd_name));
            if !db_allowed {
                return Err(SessionError::OperationNotSupportedInTransaction(format!(
                    "Cannot run command against the '{}' database in a transaction.",
                    db_name
                )));
            }
        }

        let mut inner = self.inner.lock();
        self.begin_or_continue_locked(&mut inner, txn_number, autocommit, start_transaction)
    }

    /// Migration admission: advances the transaction number without the
    /// autocommit/startTransaction argument validation of the user path.
    pub fn begin_or_continue_on_migration(
        &self,
        op: &mut OperationContext,
        txn_number: TxnNumber,
    ) -> Result<()> {
        assert!(!op.is_direct_client());
        assert!(!op.locker_ref().is_locked());

        let mut inner = self.inner.lock();
        self.check_valid(&inner)?;
        self.check_txn_valid(&inner, txn_number)?;

        if txn_number == inner.active_txn_number {
            return Ok(());
        }
        self.set_active_txn(&mut inner, txn_number);
        Ok(())
    }

    fn begin_or_continue_locked(
        &self,
        inner: &mut ControllerInner,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
        start_transaction: Option<bool>,
    ) -> Result<()> {
        self.check_valid(inner)?;
        self.check_txn_valid(inner, txn_number)?;

        //
        // Continue an active transaction or retryable write.
        //
        if txn_number == inner.active_txn_number {
            if start_transaction.is_some() {
                return Err(SessionError::ConflictingOperationInProgress(format!(
                    "Cannot specify 'startTransaction' on transaction {} since it is already \
                     in progress.",
                    txn_number
                )));
            }

            // Continue a retryable write.
            if inner.txn_state.is_none() {
                if autocommit.is_some() {
                    return Err(SessionError::InvalidOptions(
                        "Cannot specify 'autocommit' on an operation not inside a \
                         multi-statement transaction."
                            .to_string(),
                    ));
                }
                return Ok(());
            }

            // Continue a multi-statement transaction; every operation after
            // the first must carry an explicit autocommit=false.
            if !inner.autocommit {
                if autocommit != Some(false) {
                    return Err(SessionError::InvalidOptions(
                        "Must specify autocommit=false on all operations of a multi-statement \
                         transaction."
                            .to_string(),
                    ));
                }
                if inner.txn_state.is_in_progress() && inner.txn_resource_stash.is_none() {
                    // The first command of the transaction failed before
                    // stashing. The read concern it captured is gone, so it
                    // is not safe to continue.
                    self.abort_transaction_locked(inner);
                    return Err(SessionError::NoSuchTransaction(format!(
                        "Transaction {} has been aborted.",
                        txn_number
                    )));
                }
            }
            return Ok(());
        }

        //
        // Start something new. An 'autocommit' argument means a
        // multi-statement transaction; its absence means a retryable write.
        //
        match autocommit {
            Some(false) => {
                if start_transaction.is_none() {
                    return Err(SessionError::NoSuchTransaction(format!(
                        "Given transaction number {} does not match any in-progress \
                         transactions.",
                        txn_number
                    )));
                }
                self.set_active_txn(inner, txn_number);
                inner.autocommit = false;
                inner
                    .txn_state
                    .transition_to(TxnState::InProgress, TransitionValidation::Validate);

                let now = Timestamp::now();
                inner.txn_stats = Some(SingleTransactionStats::new(now));
                let lifetime_secs = self.config.transaction_lifetime_limit_secs() as u64;
                inner.transaction_expire_date = Some(now.add_secs(lifetime_secs));

                self.metrics.increment_total_started();
                self.metrics.increment_current_open();
            }
            Some(true) => {
                return Err(SessionError::InvalidOptions(
                    "autocommit must be false for a multi-statement transaction".to_string(),
                ));
            }
            None => {
                if start_transaction.is_some() {
                    return Err(SessionError::InvalidOptions(
                        "Cannot specify 'startTransaction' without autocommit=false".to_string(),
                    ));
                }
                // A retryable write: no state transition beyond TxnState::None.
                self.set_active_txn(inner, txn_number);
                inner.autocommit = true;
                inner
                    .txn_state
                    .transition_to(TxnState::None, TransitionValidation::Validate);
                inner.txn_stats = None;
            }
        }

        assert!(
            inner.transaction_operations.is_empty(),
            "operation buffer must be empty after starting a transaction"
        );
        Ok(())
    }

    // === Stash / unstash ===

    /// Park the transaction's resources at the end of a request. A no-op
    /// for retryable writes.
    pub fn stash_transaction_resources(&self, op: &mut OperationContext) -> Result<()> {
        if op.is_direct_client() {
            return Ok(());
        }
        let txn_number = op
            .txn_number()
            .expect("cannot stash resources for an operation without a transaction number");

        // Client lock before session mutex: clients own sessions, and this
        // path mutates the operation bound to the client.
        let client = Arc::clone(op.client());
        let _client_lock = client.lock();
        let mut inner = self.inner.lock();

        // Always check the active number: migration can move it without
        // checking out the session. Aborted is acceptable here; this runs
        // at the tail of the abort command itself.
        self.check_is_active(&inner, txn_number, false)?;

        if !inner.txn_state.in_multi_document_transaction() {
            return Ok(());
        }

        let now = Timestamp::now();
        if let Some(stats) = inner.txn_stats.as_mut() {
            if stats.is_active() {
                stats.set_inactive(now);
            }
            stats.op_debug_mut().additive.add(&op.op_debug().additive);
        }

        assert!(
            inner.txn_resource_stash.is_none(),
            "stash slot already holds transaction resources"
        );
        inner.txn_resource_stash = Some(TxnResources::capture(
            op,
            self.config.max_transaction_lock_request_timeout(),
        ));

        // Counter pairs updated without joint atomicity; slight transient
        // skew is accepted.
        self.metrics.decrement_current_active();
        self.metrics.increment_current_inactive();

        if let Some(stats) = inner.txn_stats.as_mut() {
            stats.update_last_client_info(op.client());
        }
        Ok(())
    }

    /// Restore the transaction's resources at the start of a request, or
    /// set up fresh ones on first entry into a new transaction.
    pub fn unstash_transaction_resources(
        &self,
        op: &mut OperationContext,
        cmd_name: &str,
    ) -> Result<()> {
        if op.is_direct_client() {
            return Ok(());
        }
        let txn_number = op
            .txn_number()
            .expect("cannot unstash resources for an operation without a transaction number");

        {
            let client = Arc::clone(op.client());
            let _client_lock = client.lock();
            let mut inner = self.inner.lock();

            // Session kill and migration mutate this state without checking
            // out the session; re-validate under the mutex.
            self.check_is_active(&inner, txn_number, false)?;

            // Not in a multi-statement transaction: nothing to unstash.
            if inner.txn_state.is_none() {
                assert!(inner.txn_resource_stash.is_none());
                return Ok(());
            }

            // This is the entry point of transaction execution, so report
            // an aborted transaction as missing.
            if inner.txn_state.is_aborted() {
                return Err(SessionError::NoSuchTransaction(format!(
                    "Transaction {} has been aborted.",
                    txn_number
                )));
            }

            // A committed transaction cannot change, but retrying the
            // commit command is allowed.
            if inner.txn_state.is_committed() && cmd_name != "commitTransaction" {
                return Err(SessionError::TransactionCommitted(txn_number));
            }

            if inner.txn_resource_stash.is_some() {
                if !op.read_concern().is_empty() {
                    return Err(SessionError::InvalidOptions(
                        "Only the first command in a transaction may specify a readConcern"
                            .to_string(),
                    ));
                }
                inner
                    .txn_resource_stash
                    .as_mut()
                    .expect("stash checked above")
                    .release(op)?;
                inner.txn_resource_stash = None;

                if inner.txn_state.is_in_progress() {
                    if let Some(stats) = inner.txn_stats.as_mut() {
                        stats.set_active(Timestamp::now());
                    }
                }
                self.metrics.increment_current_active();
                self.metrics.decrement_current_inactive();
                return Ok(());
            }

            // With no stashed resources the transaction cannot be prepared:
            // a prepared transaction survives its request inside the stash.
            assert!(
                !inner.txn_state.is_prepared(),
                "prepared transaction has no stashed resources"
            );

            if !inner.txn_state.is_in_progress() {
                // Committed with a commit retry in flight, or already
                // committing. Nothing to set up.
                return Ok(());
            }

            // First entry into a brand-new transaction: set up fresh
            // resources on the operation.
            op.begin_write_unit();
            self.metrics.increment_current_active();
            if let Some(stats) = inner.txn_stats.as_mut() {
                stats.set_active(Timestamp::now());
            }

            // Cap every lock request made inside the transaction to bound
            // the deadlock window against fast metadata operations.
            if let Some(timeout) = self.config.max_transaction_lock_request_timeout() {
                op.locker().set_max_lock_timeout(timeout);
            }
        }

        // Storage engines may start transactions lazily. Force the
        // point-in-time snapshot to exist now, under the global intent
        // lock that protects the transaction for its whole lifetime. The
        // lock is intent-exclusive from the start: the transaction may
        // write, and upgrading intent-shared later is not deadlock-safe.
        op.locker().lock_global(LockMode::IntentExclusive)?;
        op.recovery_unit().preallocate_snapshot();

        // The client lock must not be held while paused here, since that
        // would block state reporting.
        HANG_AFTER_PREALLOCATE_SNAPSHOT.pause_while_set();
        Ok(())
    }

    // === Prepare and commit ===

    /// Drive the first phase of a two-phase commit, returning the prepare
    /// timestamp. Any failure along the way aborts the active transaction.
    pub fn prepare_transaction(&self, op: &mut OperationContext) -> Result<Timestamp> {
        let result = self.prepare_inner(op);
        if result.is_err() {
            self.abort_active_transaction(op);
        }
        result
    }

    fn prepare_inner(&self, op: &mut OperationContext) -> Result<Timestamp> {
        let txn_number = op
            .txn_number()
            .expect("cannot prepare an operation without a transaction number");

        let mut inner = self.inner.lock();
        self.check_is_active(&inner, txn_number, true)?;
        inner
            .txn_state
            .transition_to(TxnState::Prepared, TransitionValidation::Validate);
        drop(inner);

        // The observer may re-enter this controller; it runs unlocked.
        let observer = op.observer();
        observer.on_transaction_prepare(op);

        let inner = self.inner.lock();
        self.check_is_active(&inner, txn_number, true)?;
        assert!(
            inner.txn_state.is_prepared(),
            "Current state: {}",
            inner.txn_state.state()
        );

        let prepare_ts = op.prepare_write_unit()?;
        drop(inner);
        Ok(prepare_ts)
    }

    /// Commit a transaction that was never prepared
    pub fn commit_unprepared_transaction(&self, op: &mut OperationContext) -> Result<()> {
        let txn_number = op
            .txn_number()
            .expect("cannot commit an operation without a transaction number");

        let mut inner = self.inner.lock();
        self.check_is_active(&inner, txn_number, true)?;

        // Retrying the commit of a committed transaction succeeds without
        // doing anything.
        if inner.txn_state.is_committed() {
            return Ok(());
        }
        if inner.txn_state.is_prepared() {
            return Err(SessionError::InvalidOptions(
                "commitTransaction must provide a commit timestamp to a prepared transaction."
                    .to_string(),
            ));
        }

        inner.txn_state.transition_to(
            TxnState::CommittingWithoutPrepare,
            TransitionValidation::Validate,
        );
        drop(inner);

        let observer = op.observer();
        observer.on_transaction_commit(op, false);

        let inner = self.inner.lock();
        self.check_is_active(&inner, txn_number, true)?;
        self.commit_locked(inner, op)
    }

    /// Commit a prepared transaction at an explicit commit timestamp
    pub fn commit_prepared_transaction(
        &self,
        op: &mut OperationContext,
        commit_timestamp: Timestamp,
    ) -> Result<()> {
        let txn_number = op
            .txn_number()
            .expect("cannot commit an operation without a transaction number");

        let mut inner = self.inner.lock();
        self.check_is_active(&inner, txn_number, true)?;

        if inner.txn_state.is_committed() {
            return Ok(());
        }
        if !inner.txn_state.is_prepared() {
            return Err(SessionError::InvalidOptions(
                "commitTransaction cannot provide a commit timestamp to an unprepared \
                 transaction."
                    .to_string(),
            ));
        }
        if commit_timestamp.is_zero() {
            return Err(SessionError::InvalidOptions(
                "'commitTimestamp' cannot be null".to_string(),
            ));
        }

        inner.txn_state.transition_to(
            TxnState::CommittingWithPrepare,
            TransitionValidation::Validate,
        );
        op.recovery_unit().set_commit_timestamp(commit_timestamp);
        drop(inner);

        let observer = op.observer();
        observer.on_transaction_commit(op, true);

        let inner = self.inner.lock();
        self.check_is_active(&inner, txn_number, true)?;
        self.commit_locked(inner, op)
    }

    /// Shared tail of both commit flavors. Commits the write unit with the
    /// mutex released; a storage failure drives the state machine to
    /// Aborted instead. Either way the operation is left without
    /// transactional storage settings.
    fn commit_locked(
        &self,
        inner: MutexGuard<'_, ControllerInner>,
        op: &mut OperationContext,
    ) -> Result<()> {
        drop(inner);

        let commit_result = op.commit_write_unit();
        let now = Timestamp::now();

        let result = match commit_result {
            Ok(()) => {
                let mut inner = self.inner.lock();

                // A read-only transaction wrote nothing to wait on; move
                // the client's replication tracker to the snapshot's
                // op-time so write-concern waits cover the data read.
                // Gated on the captured read concern level.
                let level = op.read_concern().effective_level();
                if matches!(level, ReadConcernLevel::Majority | ReadConcernLevel::Snapshot)
                    && !inner.speculative_read_op_time.is_null()
                {
                    op.client().advance_last_op(inner.speculative_read_op_time);
                }

                inner
                    .txn_state
                    .transition_to(TxnState::Committed, TransitionValidation::Validate);
                self.metrics.increment_total_committed();
                if let Some(stats) = inner.txn_stats.as_mut() {
                    stats.set_end_time(now);
                    if stats.is_active() {
                        stats.set_inactive(now);
                    }
                }
                self.metrics.decrement_current_open();
                self.metrics.decrement_current_active();
                Self::absorb_op_debug(&mut inner, op);
                Ok(())
            }
            Err(e) => {
                // The storage commit failed and the lock is not held; the
                // write unit is already gone from the operation.
                let mut inner = self.inner.lock();
                if op.txn_number() == Some(inner.active_txn_number) {
                    inner
                        .txn_state
                        .transition_to(TxnState::Aborted, TransitionValidation::Validate);
                    self.metrics.decrement_current_active();
                    if let Some(stats) = inner.txn_stats.as_mut() {
                        stats.set_end_time(now);
                        if stats.is_active() {
                            stats.set_inactive(now);
                        }
                    }
                    self.metrics.increment_total_aborted();
                    self.metrics.decrement_current_open();
                    Self::absorb_op_debug(&mut inner, op);
                }
                Err(e.into())
            }
        };

        // Post-transaction writes on this operation must run without
        // transactional settings such as a read timestamp or lock cap.
        op.replace_recovery_unit();
        op.locker().unset_max_lock_timeout();
        result
    }

    // === Aborts ===

    /// Abort the transaction bound to `op`, wiping its storage state off
    /// the operation. Safe on an empty write unit.
    pub fn abort_active_transaction(&self, op: &mut OperationContext) {
        let mut inner = self.inner.lock();

        if !inner.txn_state.in_multi_document_transaction() {
            return;
        }

        self.abort_transaction_locked(&mut inner);

        op.abort_write_unit();
        // Post-transaction writes must not inherit the transaction's read
        // timestamp or lock cap.
        op.replace_recovery_unit();
        op.locker().unset_max_lock_timeout();

        Self::absorb_op_debug(&mut inner, op);
    }

    /// Abort without a bound operation (expiry, session kill). Never
    /// aborts a prepared transaction; only an explicit commit or abort
    /// command may resolve one.
    pub fn abort_arbitrary_transaction(&self) {
        let mut inner = self.inner.lock();
        self.abort_arbitrary_locked(&mut inner);
    }

    /// Abort an unprepared transaction whose lifetime has expired
    pub fn abort_arbitrary_transaction_if_expired(&self) {
        let mut inner = self.inner.lock();
        let expired = inner
            .transaction_expire_date
            .map(|expire| expire < Timestamp::now())
            .unwrap_or(false);
        if !expired {
            return;
        }
        tracing::info!(
            session = %self.session_id,
            txn_number = %inner.active_txn_number,
            "aborting expired transaction"
        );
        self.abort_arbitrary_locked(&mut inner);
    }

    fn abort_arbitrary_locked(&self, inner: &mut ControllerInner) {
        if !inner.txn_state.is_in_progress() {
            // Prepared transactions are immune to arbitrary aborts, and
            // terminal states have nothing to abort.
            return;
        }
        self.abort_transaction_locked(inner);
    }

    fn abort_transaction_locked(&self, inner: &mut ControllerInner) {
        // A stashed transaction is inactive, an unstashed one active.
        if inner.txn_resource_stash.is_some() {
            self.metrics.decrement_current_inactive();
        } else {
            self.metrics.decrement_current_active();
        }

        inner.txn_resource_stash = None;
        inner.transaction_operations.clear();
        inner.transaction_operation_bytes = 0;
        inner
            .txn_state
            .transition_to(TxnState::Aborted, TransitionValidation::Validate);
        inner.speculative_read_op_time = OpTime::null();
        self.metrics.increment_total_aborted();

        let now = Timestamp::now();
        if let Some(stats) = inner.txn_stats.as_mut() {
            stats.set_end_time(now);
            if stats.is_active() {
                stats.set_inactive(now);
            }
        }
        self.metrics.decrement_current_open();
    }

    // === Operation buffer ===

    /// Buffer one statement-level replication operation for the in-progress
    /// transaction. The cumulative size cap fails the add rather than the
    /// eventual commit.
    pub fn add_transaction_operation(
        &self,
        op: &mut OperationContext,
        operation: ReplOperation,
    ) -> Result<()> {
        let txn_number = op
            .txn_number()
            .expect("cannot buffer operations without a transaction number");

        let mut inner = self.inner.lock();
        self.check_is_active(&inner, txn_number, true)?;
        assert!(
            inner.txn_state.is_in_progress(),
            "Current state: {}",
            inner.txn_state.state()
        );
        assert!(!inner.autocommit && inner.active_txn_number != TxnNumber::UNINITIALIZED);
        assert!(op.in_write_unit(), "operations must be buffered inside a write unit");

        inner.transaction_operation_bytes += operation.serialized_size();
        inner.transaction_operations.push(operation);
        if inner.transaction_operation_bytes > MAX_TRANSACTION_SIZE_BYTES {
            return Err(SessionError::TransactionTooLarge {
                size: inner.transaction_operation_bytes,
                limit: MAX_TRANSACTION_SIZE_BYTES,
            });
        }
        Ok(())
    }

    /// Take the buffered operations out of the controller to build the
    /// transaction's commit entry. Only legal while prepared or committing
    /// without prepare.
    pub fn end_transaction_and_retrieve_operations(
        &self,
        op: &mut OperationContext,
    ) -> Result<Vec<ReplOperation>> {
        let txn_number = op
            .txn_number()
            .expect("cannot retrieve operations without a transaction number");

        let mut inner = self.inner.lock();
        self.check_is_active(&inner, txn_number, true)?;
        assert!(
            inner.txn_state.is_prepared() || inner.txn_state.is_committing_without_prepare(),
            "Current state: {}",
            inner.txn_state.state()
        );
        assert!(!inner.autocommit);

        inner.transaction_operation_bytes = 0;
        Ok(std::mem::take(&mut inner.transaction_operations))
    }

    // === Retryable writes ===

    /// Select the last-applied read source and materialize the snapshot,
    /// recording the speculative read op-time the transaction started at.
    pub fn set_speculative_read_op_time_to_last_applied(&self, op: &mut OperationContext) {
        let mut inner = self.inner.lock();
        let recovery_unit = op.recovery_unit();
        recovery_unit.set_timestamp_read_source(ReadSource::LastApplied);
        recovery_unit.preallocate_snapshot();
        let read_ts = recovery_unit
            .read_timestamp()
            .unwrap_or_else(|| fatal_invariant("snapshot preallocation produced no read timestamp"));
        // Transactions do not survive term changes, so pairing the current
        // term with the snapshot timestamp is race-free.
        inner.speculative_read_op_time = OpTime::new(read_ts, op.engine().current_term());
    }

    /// Record the completion of a retryable write: verify no statement
    /// re-executed, persist the session record inside the caller's write
    /// unit, and register the cache update to run when that unit commits.
    pub fn on_write_completed(
        self: &Arc<Self>,
        op: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_ids: &[StmtId],
        last_write_op_time: OpTime,
        last_write_date: Timestamp,
    ) -> Result<()> {
        assert!(
            op.in_write_unit(),
            "write completion must run inside the write unit it describes"
        );

        let record = {
            let inner = self.inner.lock();
            for stmt_id in stmt_ids {
                // A statement already committed at a different position is
                // a double execution; the same position is a replay of this
                // very write and changes nothing.
                if let Some(existing) =
                    self.check_statement_executed_locked(&inner, txn_number, *stmt_id)?
                {
                    if existing != last_write_op_time {
                        fatal_on_repeated_execution(
                            self.session_id,
                            txn_number,
                            *stmt_id,
                            existing,
                            last_write_op_time,
                        );
                    }
                }
            }
            SessionRecord {
                session_id: self.session_id,
                txn_number,
                last_write_op_time,
                last_write_date,
            }
        };

        update_session_record(op, &record)?;
        self.register_update_cache_on_commit(
            op,
            txn_number,
            stmt_ids.to_vec(),
            last_write_op_time,
            last_write_date,
        )
    }

    /// Migration admission for one statement. Returns false when the
    /// statement already executed on this node. Tolerates truncated
    /// history by treating the dead-end sentinel as already executed.
    pub fn on_migrate_begin(
        &self,
        op: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<bool> {
        self.begin_or_continue_on_migration(op, txn_number)?;

        match self.check_statement_executed(txn_number, stmt_id) {
            Ok(Some(_)) => Ok(false),
            Ok(None) => Ok(true),
            Err(SessionError::IncompleteTransactionHistory { .. }) => {
                // The chain was truncated on this node; keep copying from
                // the donor to recover the full history, except for the
                // dead-end sentinel itself.
                if stmt_id == StmtId::INCOMPLETE_HISTORY {
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Record migrated statements, preferring the transaction's own last
    /// write date over the donor's so the timestamp never moves backward.
    pub fn on_migrate_completed(
        self: &Arc<Self>,
        op: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_ids: &[StmtId],
        last_write_op_time: OpTime,
        oplog_last_write_date: Timestamp,
    ) -> Result<()> {
        assert!(op.in_write_unit());

        let record = {
            let inner = self.inner.lock();
            self.check_valid(&inner)?;
            self.check_is_active(&inner, txn_number, false)?;

            let txn_last_write_date = self.last_write_date_locked(&inner, txn_number)?;
            let last_write_date = if txn_last_write_date.is_zero() {
                oplog_last_write_date
            } else {
                txn_last_write_date
            };
            SessionRecord {
                session_id: self.session_id,
                txn_number,
                last_write_op_time,
                last_write_date,
            }
        };

        update_session_record(op, &record)?;
        self.register_update_cache_on_commit(
            op,
            txn_number,
            stmt_ids.to_vec(),
            last_write_op_time,
            record.last_write_date,
        )
    }

    /// Durable chain head for the active transaction, from the cached
    /// record
    pub fn last_write_op_time(&self, txn_number: TxnNumber) -> Result<OpTime> {
        let inner = self.inner.lock();
        self.check_valid(&inner)?;
        self.check_is_active(&inner, txn_number, false)?;

        Ok(match inner.last_written_record.as_ref() {
            Some(record) if record.txn_number == txn_number => record.last_write_op_time,
            _ => OpTime::null(),
        })
    }

    /// Whether `stmt_id` already executed, returning its oplog entry.
    /// Raises `IncompleteTransactionHistory` when the statement is unknown
    /// and older history was truncated.
    pub fn check_statement_executed(
        &self,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Option<OplogEntry>> {
        let stmt_op_time = {
            let inner = self.inner.lock();
            self.check_statement_executed_locked(&inner, txn_number, stmt_id)?
        };
        let Some(stmt_op_time) = stmt_op_time else {
            return Ok(None);
        };

        let mut chain = OplogChainIterator::new(Arc::clone(&self.engine), stmt_op_time);
        while chain.has_next() {
            let entry = chain.next()?;
            if entry.stmt_id == Some(stmt_id) {
                return Ok(Some(entry));
            }
        }
        fatal_invariant("statement recorded as committed but absent from its oplog chain");
    }

    /// The no-I/O variant: consult only the in-memory map
    pub fn check_statement_executed_no_oplog_fetch(
        &self,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(self
            .check_statement_executed_locked(&inner, txn_number, stmt_id)?
            .is_some())
    }

    fn check_statement_executed_locked(
        &self,
        inner: &ControllerInner,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> Result<Option<OpTime>> {
        self.check_valid(inner)?;
        self.check_is_active(inner, txn_number, false)?;

        // Retries are not detected for multi-statement transactions.
        if !inner.txn_state.is_none() {
            return Ok(None);
        }

        match inner.committed_statements.get(&stmt_id) {
            None => {
                if inner.has_incomplete_history {
                    return Err(SessionError::IncompleteTransactionHistory {
                        session_id: self.session_id,
                        txn_number,
                    });
                }
                Ok(None)
            }
            Some(op_time) => {
                let record = inner
                    .last_written_record
                    .as_ref()
                    .expect("committed statements require a cached session record");
                assert!(record.txn_number == txn_number);
                Ok(Some(*op_time))
            }
        }
    }

    /// Register the in-memory cache update to run if and when the user's
    /// write unit really commits. Updating eagerly on the write path would
    /// desynchronize the cache from durable state on rollback.
    fn register_update_cache_on_commit(
        self: &Arc<Self>,
        op: &mut OperationContext,
        new_txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        write_op_time: OpTime,
        write_date: Timestamp,
    ) -> Result<()> {
        let controller = Arc::clone(self);
        let retryable_stats = Arc::clone(&self.retryable_stats);

        op.recovery_unit().on_commit(move |_commit_ts| {
            retryable_stats.increment_transactions_collection_write_count();

            let mut inner = controller.inner.lock();
            if !inner.valid {
                return;
            }

            // The cached record must always advance after a write so the
            // next write chains from the right position.
            let record = inner.last_written_record.get_or_insert_with(|| SessionRecord {
                session_id: controller.session_id,
                txn_number: new_txn_number,
                last_write_op_time: write_op_time,
                last_write_date: write_date,
            });
            if new_txn_number > record.txn_number {
                record.txn_number = new_txn_number;
            }
            if write_op_time > record.last_write_op_time {
                record.last_write_op_time = write_op_time;
            }
            if write_date > record.last_write_date {
                record.last_write_date = write_date;
            }

            if new_txn_number > inner.active_txn_number {
                // The cache was invalidated and refreshed while this write
                // was committing, before any write for the new number
                // landed; advance the session the way a retryable-write
                // begin would.
                controller.set_active_txn(&mut inner, new_txn_number);
                inner.autocommit = true;
                inner.txn_stats = None;
            }

            if new_txn_number == inner.active_txn_number {
                for stmt_id in &stmt_ids {
                    if *stmt_id == StmtId::INCOMPLETE_HISTORY {
                        inner.has_incomplete_history = true;
                        continue;
                    }
                    match inner.committed_statements.get(stmt_id) {
                        Some(existing) if *existing != write_op_time => {
                            fatal_on_repeated_execution(
                                controller.session_id,
                                new_txn_number,
                                *stmt_id,
                                *existing,
                                write_op_time,
                            );
                        }
                        Some(_) => {}
                        None => {
                            inner.committed_statements.insert(*stmt_id, write_op_time);
                        }
                    }
                }
            }
        });

        if ON_PRIMARY_TRANSACTIONAL_WRITE.is_enabled() {
            let data = ON_PRIMARY_TRANSACTIONAL_WRITE.data();
            let close_connection = data
                .get("closeConnection")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if close_connection {
                op.client().disconnect();
            }
            if let Some(code) = data.get("failBeforeCommitErrorCode").and_then(|v| v.as_i64()) {
                tracing::warn!(
                    session = %self.session_id,
                    txn_number = %new_txn_number,
                    code,
                    "failing write due to enabled failpoint; the write must not be reflected"
                );
                return Err(SessionError::InjectedFailure(code));
            }
        }
        Ok(())
    }

    // === Reporting ===

    /// Render the stashed (inactive) transaction for state reporting
    pub fn report_stashed_state(&self) -> Option<serde_json::Value> {
        let inner = self.inner.lock();

        let stash = inner.txn_resource_stash.as_ref()?;
        let locker_info = stash.locker_info()?;
        assert!(inner.active_txn_number != TxnNumber::UNINITIALIZED);

        let last_client = inner
            .txn_stats
            .as_ref()
            .and_then(|stats| stats.last_client_info());

        Some(json!({
            "desc": "inactive transaction",
            "client": last_client.map(|c| c.client_desc.clone()),
            "connectionId": last_client.map(|c| c.connection_id),
            "appName": last_client.map(|c| c.app_name.clone()),
            "lsid": self.session_id.to_string(),
            "transaction": self.report_transaction_stats(&inner, stash.read_concern()),
            "waitingForLock": false,
            "active": false,
            "lockStats": serde_json::to_value(&locker_info).unwrap_or(serde_json::Value::Null),
        }))
    }

    /// Render the running (unstashed) transaction for state reporting
    pub fn report_unstashed_state(
        &self,
        read_concern: &ReadConcernArgs,
    ) -> Option<serde_json::Value> {
        let inner = self.inner.lock();
        if inner.txn_resource_stash.is_some() {
            return None;
        }
        Some(json!({
            "transaction": self.report_transaction_stats(&inner, read_concern),
        }))
    }

    fn report_transaction_stats(
        &self,
        inner: &ControllerInner,
        read_concern: &ReadConcernArgs,
    ) -> serde_json::Value {
        if !inner.txn_state.in_multi_document_transaction() {
            // Retryable writes report only the transaction number.
            return json!({
                "parameters": { "txnNumber": inner.active_txn_number.get() },
            });
        }

        let stats = inner
            .txn_stats
            .as_ref()
            .expect("multi-statement transaction must have stats");
        let now = Timestamp::now();
        json!({
            "parameters": {
                "txnNumber": inner.active_txn_number.get(),
                "autocommit": inner.autocommit,
                "readConcern": serde_json::to_value(read_concern)
                    .unwrap_or(serde_json::Value::Null),
            },
            "readTimestamp": inner.speculative_read_op_time.ts.as_micros(),
            "startWallClockTime": stats.start_time().as_micros(),
            "timeOpenMicros": stats.duration_micros(now),
            "timeActiveMicros": stats.time_active_micros(now),
            "timeInactiveMicros": stats.time_inactive_micros(now),
        })
    }

    /// One-line summary of a completed transaction for the slow-operation
    /// log
    pub fn transaction_info_for_log(&self, lock_stats: &LockerInfo) -> String {
        let inner = self.inner.lock();
        assert!(
            inner.txn_state.is_committed() || inner.txn_state.is_aborted(),
            "transaction must be in a terminal state to log"
        );
        let stats = inner
            .txn_stats
            .as_ref()
            .expect("completed transaction must have stats");

        let parameters = json!({
            "lsid": self.session_id.to_string(),
            "txnNumber": inner.active_txn_number.get(),
            "autocommit": inner.autocommit,
        });

        let termination_cause = if inner.txn_state.is_committed() {
            "committed"
        } else {
            "aborted"
        };
        let now = Timestamp::now();

        let mut line = String::new();
        let _ = write!(line, "parameters:{},", parameters);
        let _ = write!(
            line,
            " readTimestamp:{},",
            inner.speculative_read_op_time.ts
        );
        let _ = write!(line, " {}", stats.op_debug().additive.report());
        let _ = write!(line, " terminationCause:{}", termination_cause);
        let _ = write!(line, " timeActiveMicros:{}", stats.time_active_micros(now));
        let _ = write!(
            line,
            " timeInactiveMicros:{}",
            stats.time_inactive_micros(now)
        );
        let _ = write!(line, " numYields:{}", 0);
        let _ = write!(
            line,
            " locks:{}",
            serde_json::to_value(lock_stats).unwrap_or(serde_json::Value::Null)
        );
        let _ = write!(line, " {}ms", stats.duration_micros(now) / 1000);
        line
    }

    // === Private helpers ===

    fn check_valid(&self, inner: &ControllerInner) -> Result<()> {
        if !inner.valid {
            return Err(SessionError::ConflictingOperationInProgress(format!(
                "Session {} was concurrently modified and the operation must be retried.",
                self.session_id
            )));
        }
        Ok(())
    }

    fn check_txn_valid(&self, inner: &ControllerInner, txn_number: TxnNumber) -> Result<()> {
        if txn_number < inner.active_txn_number {
            return Err(SessionError::TransactionTooOld {
                session_id: self.session_id,
                requested: txn_number,
                active: inner.active_txn_number,
            });
        }
        Ok(())
    }

    fn check_is_active(
        &self,
        inner: &ControllerInner,
        txn_number: TxnNumber,
        check_abort: bool,
    ) -> Result<()> {
        if txn_number != inner.active_txn_number {
            return Err(SessionError::ConflictingOperationInProgress(format!(
                "Cannot perform operations on transaction {} on session {} because a \
                 different transaction {} is now active.",
                txn_number, self.session_id, inner.active_txn_number
            )));
        }
        if check_abort && inner.txn_state.is_aborted() {
            return Err(SessionError::NoSuchTransaction(format!(
                "Transaction {} has been aborted.",
                txn_number
            )));
        }
        Ok(())
    }

    /// Make `txn_number` the session's active transaction, aborting any
    /// in-progress predecessor
    fn set_active_txn(&self, inner: &mut ControllerInner, txn_number: TxnNumber) {
        if inner.txn_state.is_in_progress() {
            self.abort_transaction_locked(inner);
        }
        inner.active_txn_number = txn_number;
        inner.committed_statements.clear();
        inner.has_incomplete_history = false;
        inner
            .txn_state
            .transition_to(TxnState::None, TransitionValidation::Validate);
        inner.txn_stats = None;
        inner.speculative_read_op_time = OpTime::null();
    }

    fn last_write_date_locked(
        &self,
        inner: &ControllerInner,
        txn_number: TxnNumber,
    ) -> Result<Timestamp> {
        self.check_valid(inner)?;
        self.check_is_active(inner, txn_number, false)?;

        Ok(match inner.last_written_record.as_ref() {
            Some(record) if record.txn_number == txn_number => record.last_write_date,
            _ => Timestamp::MIN,
        })
    }

    fn absorb_op_debug(inner: &mut ControllerInner, op: &OperationContext) {
        if let Some(stats) = inner.txn_stats.as_mut() {
            stats.op_debug_mut().additive.add(&op.op_debug().additive);
            stats.update_last_client_info(op.client());
        }
    }
}
