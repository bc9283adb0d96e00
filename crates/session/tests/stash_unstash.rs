//! The stash/unstash protocol: round-trip identity and exclusive ownership

mod common;

use common::Harness;
use papyrus_common::{ReadConcernArgs, ReadConcernLevel, SessionId, TxnNumber};
use papyrus_session::{SessionController, TxnState};
use papyrus_storage::ClientState;
use std::sync::Arc;

fn start_and_unstash(
    harness: &Harness,
    controller: &Arc<SessionController>,
    number: i64,
) -> papyrus_session::OperationContext {
    let mut op = harness.op();
    op.set_read_concern(ReadConcernArgs::new(ReadConcernLevel::Snapshot));
    let txn = TxnNumber::new(number);
    op.set_txn_number(txn);
    controller
        .begin_or_continue(&mut op, txn, Some(false), Some(true), "app", "insert")
        .unwrap();
    controller
        .unstash_transaction_resources(&mut op, "insert")
        .unwrap();
    op
}

#[test]
fn test_stash_strips_the_operation() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = start_and_unstash(&harness, &controller, 1);

    assert!(op.in_write_unit());
    assert!(op.locker_ref().is_locked());
    assert!(op.recovery_unit().read_timestamp().is_some());

    controller.stash_transaction_resources(&mut op).unwrap();

    // The operation is left with a fresh empty locker and recovery unit
    // and no write unit; the controller holds the one resource bundle.
    assert!(!op.in_write_unit());
    assert!(!op.locker_ref().is_locked());
    assert_eq!(op.locker_ref().client_state(), ClientState::Inactive);
    assert!(op.recovery_unit().read_timestamp().is_none());
    assert!(controller.has_stashed_resources());
}

#[test]
fn test_stash_then_unstash_is_a_round_trip() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = start_and_unstash(&harness, &controller, 1);

    let read_ts = op.recovery_unit().read_timestamp();
    let snapshot_id = op.recovery_unit().snapshot_id();

    controller.stash_transaction_resources(&mut op).unwrap();

    let mut next_op = harness.op();
    next_op.set_txn_number(TxnNumber::new(1));
    controller
        .unstash_transaction_resources(&mut next_op, "find")
        .unwrap();

    // The restored operation holds the same snapshot, an armed locker and
    // the read concern captured on entry.
    assert!(next_op.in_write_unit());
    assert!(next_op.locker_ref().is_locked());
    assert!(next_op.locker_ref().is_bound_to_current_thread());
    assert_eq!(next_op.recovery_unit().read_timestamp(), read_ts);
    assert_eq!(next_op.recovery_unit().snapshot_id(), snapshot_id);
    assert_eq!(
        next_op.read_concern().effective_level(),
        ReadConcernLevel::Snapshot
    );
    // Exactly one owner: the stash slot is empty again.
    assert!(!controller.has_stashed_resources());
}

#[test]
fn test_stash_is_a_noop_for_retryable_writes() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = harness.op();
    let txn = TxnNumber::new(2);
    op.set_txn_number(txn);
    controller
        .begin_or_continue(&mut op, txn, None, None, "app", "insert")
        .unwrap();

    controller.stash_transaction_resources(&mut op).unwrap();
    assert!(!controller.has_stashed_resources());
    assert_eq!(controller.state(), TxnState::None);
}

#[test]
fn test_unstash_with_nothing_stashed_on_retryable_write() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = harness.op();
    let txn = TxnNumber::new(2);
    op.set_txn_number(txn);
    controller
        .begin_or_continue(&mut op, txn, None, None, "app", "insert")
        .unwrap();

    controller
        .unstash_transaction_resources(&mut op, "insert")
        .unwrap();
    assert!(!op.in_write_unit());
}

#[test]
fn test_dropping_a_stashed_transaction_releases_resources() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = start_and_unstash(&harness, &controller, 1);

    controller.stash_transaction_resources(&mut op).unwrap();

    // Starting a newer transaction aborts the stashed one; its bundle is
    // dropped, its write unit aborted, and the global lock released.
    let mut new_op = harness.op();
    let txn = TxnNumber::new(2);
    new_op.set_txn_number(txn);
    controller
        .begin_or_continue(&mut new_op, txn, Some(false), Some(true), "app", "insert")
        .unwrap();

    assert!(!controller.has_stashed_resources());
    assert_eq!(controller.state(), TxnState::InProgress);
    assert_eq!(controller.active_txn_number(), txn);
    assert_eq!(harness.metrics.total_aborted(), 1);
}

#[test]
fn test_wrong_txn_number_is_rejected_at_stash_boundaries() {
    let harness = Harness::new();
    let controller = harness.controller(SessionId::new());
    let mut op = start_and_unstash(&harness, &controller, 3);

    // Migration advanced the session while this request was running.
    op.set_txn_number(TxnNumber::new(2));
    assert!(controller.stash_transaction_resources(&mut op).is_err());
}
