//! Retryable-write idempotency and history behavior

mod common;

use common::{run_retryable_write, Harness};
use papyrus_common::{SessionId, StmtId, Timestamp, TxnNumber};
use papyrus_session::{SessionError, ON_PRIMARY_TRANSACTIONAL_WRITE};

#[test]
fn test_retryable_write_replay_is_a_noop() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = harness.op();

    let op_time = run_retryable_write(&harness, &controller, &mut op, 7, &[1, 2]).unwrap();

    assert!(controller
        .check_statement_executed_no_oplog_fetch(TxnNumber::new(7), StmtId::new(1))
        .unwrap());
    assert!(controller
        .check_statement_executed_no_oplog_fetch(TxnNumber::new(7), StmtId::new(2))
        .unwrap());
    assert_eq!(
        controller.last_write_op_time(TxnNumber::new(7)).unwrap(),
        op_time
    );
    assert_eq!(harness.retryable_stats.transactions_collection_write_count(), 1);

    // Crash/replay: the driver retries the write with the same statement
    // ids. The write itself is suppressed by the executed check; a
    // completion call at the original op-time changes nothing.
    let mut retry_op = harness.op();
    retry_op.set_txn_number(TxnNumber::new(7));
    controller
        .begin_or_continue(&mut retry_op, TxnNumber::new(7), None, None, "app", "insert")
        .unwrap();

    let entry = controller
        .check_statement_executed(TxnNumber::new(7), StmtId::new(2))
        .unwrap()
        .expect("statement 2 already executed");
    assert_eq!(entry.stmt_id, Some(StmtId::new(2)));

    retry_op.begin_write_unit();
    controller
        .on_write_completed(
            &mut retry_op,
            TxnNumber::new(7),
            &[StmtId::new(1), StmtId::new(2)],
            op_time,
            Timestamp::now(),
        )
        .unwrap();
    retry_op.commit_write_unit().unwrap();

    assert_eq!(
        controller.last_write_op_time(TxnNumber::new(7)).unwrap(),
        op_time
    );
}

#[test]
#[should_panic(expected = "committed once with opTime")]
fn test_double_execution_at_different_op_time_is_fatal() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = harness.op();

    let first = run_retryable_write(&harness, &controller, &mut op, 7, &[1]).unwrap();

    // A second completion for statement 1 at a different position means
    // the statement executed twice.
    let mut second_op = harness.op();
    second_op.set_txn_number(TxnNumber::new(7));
    controller
        .begin_or_continue(&mut second_op, TxnNumber::new(7), None, None, "app", "insert")
        .unwrap();
    second_op.begin_write_unit();
    let different = harness.log_statement(controller.session_id(), TxnNumber::new(7), 1, first);
    let _ = controller.on_write_completed(
        &mut second_op,
        TxnNumber::new(7),
        &[StmtId::new(1)],
        different,
        Timestamp::now(),
    );
}

#[test]
fn test_cache_updates_only_when_the_write_commits() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = harness.op();

    let txn = TxnNumber::new(3);
    op.set_txn_number(txn);
    controller
        .begin_or_continue(&mut op, txn, None, None, "app", "insert")
        .unwrap();

    op.begin_write_unit();
    let op_time = harness.log_statement(controller.session_id(), txn, 0, papyrus_common::OpTime::null());
    controller
        .on_write_completed(&mut op, txn, &[StmtId::new(0)], op_time, Timestamp::now())
        .unwrap();

    // Nothing is visible before the surrounding write unit commits.
    assert!(!controller
        .check_statement_executed_no_oplog_fetch(txn, StmtId::new(0))
        .unwrap());
    assert_eq!(harness.retryable_stats.transactions_collection_write_count(), 0);

    op.commit_write_unit().unwrap();

    assert!(controller
        .check_statement_executed_no_oplog_fetch(txn, StmtId::new(0))
        .unwrap());
    assert_eq!(harness.retryable_stats.transactions_collection_write_count(), 1);
}

#[test]
fn test_rolled_back_write_leaves_no_trace() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = harness.op();

    let txn = TxnNumber::new(4);
    op.set_txn_number(txn);
    controller
        .begin_or_continue(&mut op, txn, None, None, "app", "insert")
        .unwrap();

    op.begin_write_unit();
    let op_time = harness.log_statement(controller.session_id(), txn, 0, papyrus_common::OpTime::null());
    controller
        .on_write_completed(&mut op, txn, &[StmtId::new(0)], op_time, Timestamp::now())
        .unwrap();
    op.abort_write_unit();

    assert!(!controller
        .check_statement_executed_no_oplog_fetch(txn, StmtId::new(0))
        .unwrap());
    assert_eq!(
        controller.last_write_op_time(txn).unwrap(),
        papyrus_common::OpTime::null()
    );
}

#[test]
fn test_incomplete_history_surfaces_on_read_path() {
    let harness = Harness::new();
    let session_id = SessionId::new();
    let controller = harness.controller(session_id);
    let mut op = harness.op();

    let head = run_retryable_write(&harness, &controller, &mut op, 5, &[0, 1]).unwrap();

    // Lose everything before the chain head, then force a refresh.
    harness.engine.truncate_oplog_before(head);
    controller.invalidate();

    let mut fresh_op = harness.op();
    fresh_op.set_txn_number(TxnNumber::new(5));
    controller
        .begin_or_continue(&mut fresh_op, TxnNumber::new(5), None, None, "app", "insert")
        .unwrap();

    // Statement 1 survived in the head entry; statement 0 is gone and the
    // truncation must be reported.
    assert!(controller
        .check_statement_executed_no_oplog_fetch(TxnNumber::new(5), StmtId::new(1))
        .unwrap());
    let err = controller
        .check_statement_executed_no_oplog_fetch(TxnNumber::new(5), StmtId::new(0))
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::IncompleteTransactionHistory { .. }
    ));
}

#[test]
fn test_migration_tolerates_incomplete_history() {
    let harness = Harness::new();
    let session_id = SessionId::new();
    let controller = harness.controller(session_id);
    let mut op = harness.op();

    let head = run_retryable_write(&harness, &controller, &mut op, 5, &[0, 1]).unwrap();
    harness.engine.truncate_oplog_before(head);
    controller.invalidate();

    let mut migrate_op = harness.op();
    controller
        .refresh_from_storage_if_needed(&mut migrate_op)
        .unwrap();

    // An unknown statement on a truncated chain is copied from the donor.
    assert!(controller
        .on_migrate_begin(&mut migrate_op, TxnNumber::new(5), StmtId::new(9))
        .unwrap());
    // The dead-end sentinel itself is treated as already executed.
    assert!(!controller
        .on_migrate_begin(&mut migrate_op, TxnNumber::new(5), StmtId::INCOMPLETE_HISTORY)
        .unwrap());
}

#[test]
fn test_post_write_failpoint_injects_failure_and_closes_connection() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = harness.op();

    ON_PRIMARY_TRANSACTIONAL_WRITE.enable(serde_json::json!({
        "failBeforeCommitErrorCode": 45_001,
    }));
    let result = run_retryable_write(&harness, &controller, &mut op, 2, &[0]);
    ON_PRIMARY_TRANSACTIONAL_WRITE.disable();

    assert_eq!(result.unwrap_err(), SessionError::InjectedFailure(45_001));
    // closeConnection defaults to true.
    assert!(!op.client().is_connected());
    // The write never committed, so the statement is not recorded.
    assert!(!controller
        .check_statement_executed_no_oplog_fetch(TxnNumber::new(2), StmtId::new(0))
        .unwrap());
}
