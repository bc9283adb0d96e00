//! Refresh after invalidation: rehydrating session state from storage

mod common;

use common::{run_retryable_write, CommitLoggingObserver, Harness};
use papyrus_common::{ReplOperation, SessionId, StmtId, TxnNumber};
use papyrus_session::{SessionError, TxnState};
use serde_json::json;

#[test]
fn test_refresh_restores_retryable_write_state() {
    let harness = Harness::new();
    let session_id = SessionId::new();
    let controller = harness.controller(session_id);
    let mut op = harness.op();

    let head = run_retryable_write(&harness, &controller, &mut op, 5, &[0, 1]).unwrap();

    controller.invalidate();

    // Until a refresh runs, operations are refused.
    let err = controller
        .check_statement_executed_no_oplog_fetch(TxnNumber::new(5), StmtId::new(0))
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::ConflictingOperationInProgress(_)
    ));

    let mut fresh_op = harness.op();
    controller
        .refresh_from_storage_if_needed(&mut fresh_op)
        .unwrap();

    assert_eq!(controller.active_txn_number(), TxnNumber::new(5));
    assert_eq!(
        controller.last_write_op_time(TxnNumber::new(5)).unwrap(),
        head
    );
    assert!(controller
        .check_statement_executed_no_oplog_fetch(TxnNumber::new(5), StmtId::new(1))
        .unwrap());
}

#[test]
fn test_refresh_observes_committed_transaction() {
    let harness = Harness::new();
    let session_id = SessionId::new();
    let controller = harness.controller(session_id);
    let observer = CommitLoggingObserver::new();
    observer.bind(&controller);

    // Commit transaction 5, whose commit entry lands in the oplog chain,
    // and persist the session record pointing at it the way the commit's
    // replication entry does.
    let mut op = harness.op_with_observer(observer.clone());
    let txn = TxnNumber::new(5);
    op.set_txn_number(txn);
    controller
        .begin_or_continue(&mut op, txn, Some(false), Some(true), "app", "insert")
        .unwrap();
    controller
        .unstash_transaction_resources(&mut op, "insert")
        .unwrap();
    controller
        .add_transaction_operation(&mut op, ReplOperation::insert("app.users", json!({"_id": 1})))
        .unwrap();
    controller
        .commit_unprepared_transaction(&mut op)
        .unwrap();
    assert_eq!(controller.state(), TxnState::Committed);

    let commit_op_time = observer.logged_commits.lock()[0];
    let mut record_op = harness.op();
    record_op.begin_write_unit();
    papyrus_session::update_session_record(
        &mut record_op,
        &papyrus_session::SessionRecord {
            session_id,
            txn_number: txn,
            last_write_op_time: commit_op_time,
            last_write_date: papyrus_common::Timestamp::now(),
        },
    )
    .unwrap();
    record_op.commit_write_unit().unwrap();

    // Invalidate (as migration or session kill would), then refresh.
    controller.invalidate();
    assert_eq!(controller.active_txn_number(), TxnNumber::UNINITIALIZED);

    let mut fresh_op = harness.op();
    controller
        .refresh_from_storage_if_needed(&mut fresh_op)
        .unwrap();

    // The refresh saw the commit marker and rehydrated the terminal state
    // through the relaxed transition mode.
    assert_eq!(controller.active_txn_number(), txn);
    assert_eq!(controller.state(), TxnState::Committed);
    assert_eq!(
        controller.last_write_op_time(txn).unwrap(),
        commit_op_time
    );
}

#[test]
fn test_refresh_is_idempotent() {
    let harness = Harness::new();
    let session_id = SessionId::new();
    let controller = harness.controller(session_id);
    let mut op = harness.op();

    run_retryable_write(&harness, &controller, &mut op, 3, &[0]).unwrap();

    controller.invalidate();
    let mut fresh_op = harness.op();
    controller
        .refresh_from_storage_if_needed(&mut fresh_op)
        .unwrap();
    let first = controller.active_txn_number();

    // A second refresh with no intervening invalidation changes nothing.
    controller
        .refresh_from_storage_if_needed(&mut fresh_op)
        .unwrap();
    assert_eq!(controller.active_txn_number(), first);

    // Invalidate-refresh cycles converge to the same durable state.
    controller.invalidate();
    controller
        .refresh_from_storage_if_needed(&mut fresh_op)
        .unwrap();
    assert_eq!(controller.active_txn_number(), first);
}

#[test]
fn test_concurrent_invalidation_restarts_the_refresh_loop() {
    use std::sync::Arc;

    let harness = Arc::new(Harness::new());
    let session_id = SessionId::new();
    let controller = harness.controller(session_id);
    let mut op = harness.op();

    run_retryable_write(&harness, &controller, &mut op, 4, &[0]).unwrap();

    // Hammer invalidations from another thread while refreshing; every
    // refresh must either land on durable state or be restarted, never
    // publish a half-applied view.
    let invalidator = {
        let controller = Arc::clone(&controller);
        std::thread::spawn(move || {
            for _ in 0..50 {
                controller.invalidate();
                std::thread::yield_now();
            }
        })
    };

    let mut fresh_op = harness.op();
    for _ in 0..50 {
        controller
            .refresh_from_storage_if_needed(&mut fresh_op)
            .unwrap();
    }
    invalidator.join().unwrap();

    // One final refresh settles the state.
    controller
        .refresh_from_storage_if_needed(&mut fresh_op)
        .unwrap();
    assert_eq!(controller.active_txn_number(), TxnNumber::new(4));
    assert!(controller
        .check_statement_executed_no_oplog_fetch(TxnNumber::new(4), StmtId::new(0))
        .unwrap());
}
