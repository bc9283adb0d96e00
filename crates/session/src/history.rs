//! Reconstructing session state from the durable log
//!
//! Given a session id, read the last persisted session record and walk the
//! session's oplog chain backwards, rebuilding the map of committed
//! statement ids and noting whether the chain holds a transaction commit
//! marker or has been truncated.

use crate::error::Result;
use crate::record::SessionRecord;
use papyrus_common::{fatal_invariant, OpTime, SessionId, StmtId, TxnNumber};
use papyrus_storage::{OplogChainIterator, StorageEngine, StorageError, SESSION_RECORDS_COLLECTION};
use std::collections::HashMap;
use std::sync::Arc;

/// Placeholder document written where older oplog history was truncated
pub fn dead_end_sentinel() -> serde_json::Value {
    serde_json::json!({"$incompleteOplogHistory": 1})
}

/// Everything the durable log knows about a session's current transaction
#[derive(Debug, Default)]
pub struct ActiveTransactionHistory {
    /// The last persisted session record, absent for an unseen session
    pub last_record: Option<SessionRecord>,

    /// Statement id to the op-time of its committed write
    pub committed_statements: HashMap<StmtId, OpTime>,

    /// True when the walk observed a transaction commit marker
    pub transaction_committed: bool,

    /// True when the chain crossed a truncation point or a dead-end
    /// sentinel
    pub has_incomplete_history: bool,
}

/// Committing one statement id at two different op-times means a retryable
/// write executed twice. That is data corruption; the process terminates.
pub(crate) fn fatal_on_repeated_execution(
    session_id: SessionId,
    txn_number: TxnNumber,
    stmt_id: StmtId,
    first_op_time: OpTime,
    second_op_time: OpTime,
) -> ! {
    fatal_invariant(&format!(
        "Statement id {} from transaction [ {}:{} ] was committed once with opTime \
         {} and a second time with opTime {}. This indicates possible data \
         corruption or a server bug and the process will be terminated.",
        stmt_id, session_id, txn_number, first_op_time, second_op_time
    ));
}

/// Read the session's durable record and rebuild its transaction history
pub fn fetch_active_transaction_history(
    engine: &Arc<StorageEngine>,
    session_id: SessionId,
) -> Result<ActiveTransactionHistory> {
    let mut result = ActiveTransactionHistory::default();

    let mut reader = engine.new_recovery_unit();
    let found = reader.find(
        SESSION_RECORDS_COLLECTION,
        &SessionRecord::storage_key(&session_id),
    )?;
    let record = match found {
        Some(bytes) => SessionRecord::from_bytes(&bytes)?,
        None => return Ok(result),
    };
    let chain_head = record.last_write_op_time;
    let record_txn_number = record.txn_number;
    result.last_record = Some(record);

    let mut chain = OplogChainIterator::new(Arc::clone(engine), chain_head);
    while chain.has_next() {
        let entry = match chain.next() {
            Ok(entry) => entry,
            Err(StorageError::IncompleteHistory) => {
                result.has_incomplete_history = true;
                break;
            }
            Err(e) => return Err(e.into()),
        };

        let stmt_id = entry
            .stmt_id
            .unwrap_or_else(|| fatal_invariant("session oplog chain entry has no statement id"));

        if stmt_id == StmtId::INCOMPLETE_HISTORY {
            // Only the dead-end sentinel carries this id in write history.
            if entry.document != dead_end_sentinel() {
                fatal_invariant("oplog entry with the incomplete-history statement id does not carry the dead-end sentinel");
            }
            result.has_incomplete_history = true;
            continue;
        }

        match result.committed_statements.get(&stmt_id) {
            Some(existing) if *existing != entry.op_time => {
                fatal_on_repeated_execution(
                    session_id,
                    record_txn_number,
                    stmt_id,
                    *existing,
                    entry.op_time,
                );
            }
            Some(_) => {}
            None => {
                result.committed_statements.insert(stmt_id, entry.op_time);
            }
        }

        if entry.commit_marker {
            result.transaction_committed = true;
        }
    }

    Ok(result)
}
