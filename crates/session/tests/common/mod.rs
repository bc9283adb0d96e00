//! Shared fixtures for the session controller integration suites
#![allow(dead_code)]

use papyrus_common::{OpTime, SessionId, StmtId, Timestamp, TxnNumber};
use papyrus_session::{
    Client, NoopReplicationObserver, OperationContext, ReplicationObserver, RetryableWritesStats,
    SessionConfig, SessionController, TransactionsMetrics,
};
use papyrus_storage::{OplogEntry, StorageConfig, StorageEngine};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct Harness {
    pub engine: Arc<StorageEngine>,
    pub config: Arc<SessionConfig>,
    pub metrics: Arc<TransactionsMetrics>,
    pub retryable_stats: Arc<RetryableWritesStats>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            engine: StorageEngine::new(StorageConfig::default()),
            config: Arc::new(SessionConfig::default()),
            metrics: Arc::new(TransactionsMetrics::new()),
            retryable_stats: Arc::new(RetryableWritesStats::new()),
        }
    }

    pub fn controller(&self, session_id: SessionId) -> Arc<SessionController> {
        Arc::new(SessionController::new(
            session_id,
            Arc::clone(&self.engine),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
            Arc::clone(&self.retryable_stats),
        ))
    }

    pub fn op(&self) -> OperationContext {
        self.op_with_observer(Arc::new(NoopReplicationObserver))
    }

    pub fn op_with_observer(&self, observer: Arc<dyn ReplicationObserver>) -> OperationContext {
        let client = Client::new("127.0.0.1:51000", "integration-tests");
        OperationContext::new(&self.engine, client, observer)
    }

    /// Append one retryable-write statement to the durable log, chaining it
    /// onto the session's previous write.
    pub fn log_statement(
        &self,
        session_id: SessionId,
        txn_number: TxnNumber,
        stmt_id: i32,
        prev: OpTime,
    ) -> OpTime {
        self.engine.append_oplog(OplogEntry::for_statement(
            session_id,
            txn_number,
            StmtId::new(stmt_id),
            prev,
            serde_json::json!({"stmt": stmt_id}),
        ))
    }
}

/// Observer that behaves like the replication subsystem: at commit time it
/// takes the buffered operations out of the controller (re-entering it) and
/// logs the transaction's commit entry.
pub struct CommitLoggingObserver {
    controller: Mutex<Option<Arc<SessionController>>>,
    pub logged_commits: Mutex<Vec<OpTime>>,
    pub logged_op_counts: Mutex<Vec<usize>>,
}

impl CommitLoggingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            controller: Mutex::new(None),
            logged_commits: Mutex::new(Vec::new()),
            logged_op_counts: Mutex::new(Vec::new()),
        })
    }

    pub fn bind(&self, controller: &Arc<SessionController>) {
        *self.controller.lock() = Some(Arc::clone(controller));
    }

    fn bound_controller(&self) -> Arc<SessionController> {
        self.controller
            .lock()
            .clone()
            .expect("observer not bound to a controller")
    }

    /// Take the buffered operations out of the controller, re-entering it
    /// the way the replication subsystem does.
    fn retrieve_operations(&self, op: &mut OperationContext) -> usize {
        let controller = self.bound_controller();
        let operations = controller
            .end_transaction_and_retrieve_operations(op)
            .expect("retrieving operations");
        self.logged_op_counts.lock().push(operations.len());
        operations.len()
    }

    fn log_commit_marker(&self, op: &mut OperationContext, operation_count: usize) {
        let controller = self.bound_controller();
        let txn_number = op.txn_number().expect("transaction number bound");
        let op_time = op.engine().append_oplog(OplogEntry::transaction_commit(
            controller.session_id(),
            txn_number,
            StmtId::new(0),
            OpTime::null(),
            serde_json::json!({"operations": operation_count}),
        ));
        self.logged_commits.lock().push(op_time);
    }
}

impl ReplicationObserver for CommitLoggingObserver {
    fn on_transaction_prepare(&self, op: &mut OperationContext) {
        // The prepare entry carries the operations.
        self.retrieve_operations(op);
    }

    fn on_transaction_commit(&self, op: &mut OperationContext, was_prepared: bool) {
        let count = if was_prepared {
            // Operations were taken at prepare time.
            0
        } else {
            self.retrieve_operations(op)
        };
        self.log_commit_marker(op, count);
    }
}

/// Run one complete retryable-write statement against `controller`: begin,
/// write unit, oplog entry, completion hook, commit. Returns the op-time of
/// the logged statement.
pub fn run_retryable_write(
    harness: &Harness,
    controller: &Arc<SessionController>,
    op: &mut OperationContext,
    txn_number: i64,
    stmt_ids: &[i32],
) -> papyrus_session::Result<OpTime> {
    let txn_number = TxnNumber::new(txn_number);
    op.set_txn_number(txn_number);
    controller.begin_or_continue(op, txn_number, None, None, "app", "insert")?;

    let prev = controller.last_write_op_time(txn_number)?;
    op.begin_write_unit();
    let mut last = prev;
    for stmt_id in stmt_ids {
        last = harness.log_statement(controller.session_id(), txn_number, *stmt_id, last);
    }

    let stmt_ids: Vec<StmtId> = stmt_ids.iter().map(|s| StmtId::new(*s)).collect();
    let result = controller.on_write_completed(op, txn_number, &stmt_ids, last, Timestamp::now());
    match result {
        Ok(()) => {
            op.commit_write_unit()?;
            Ok(last)
        }
        Err(e) => {
            op.abort_write_unit();
            Err(e)
        }
    }
}
