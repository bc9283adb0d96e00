//! The durable replication log
//!
//! Entries written on behalf of a session form a backward chain through
//! `prev_op_time`, starting from the position recorded in the session's
//! durable record. `OplogChainIterator` walks that chain; crossing the
//! truncation point surfaces as `IncompleteHistory`.

use crate::engine::StorageEngine;
use crate::error::{Result, StorageError};
use papyrus_common::{OpTime, SessionId, StmtId, Timestamp, TxnNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One entry in the durable replication log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Position in the log; assigned by the engine at append time
    pub op_time: OpTime,

    /// Session the entry was written on behalf of
    pub session_id: Option<SessionId>,

    pub txn_number: Option<TxnNumber>,

    /// Statement id, present on all session-chained entries
    pub stmt_id: Option<StmtId>,

    /// Previous entry in this session's chain; null-terminated
    pub prev_op_time: Option<OpTime>,

    /// True for the terminal entry that marks a transaction commit
    pub commit_marker: bool,

    pub wall_time: Timestamp,

    /// The operation payload
    pub document: serde_json::Value,
}

impl OplogEntry {
    /// Entry for one retryable-write statement
    pub fn for_statement(
        session_id: SessionId,
        txn_number: TxnNumber,
        stmt_id: StmtId,
        prev_op_time: OpTime,
        document: serde_json::Value,
    ) -> Self {
        Self {
            op_time: OpTime::null(),
            session_id: Some(session_id),
            txn_number: Some(txn_number),
            stmt_id: Some(stmt_id),
            prev_op_time: Some(prev_op_time),
            commit_marker: false,
            wall_time: Timestamp::now(),
            document,
        }
    }

    /// Terminal entry marking the commit of a multi-statement transaction
    pub fn transaction_commit(
        session_id: SessionId,
        txn_number: TxnNumber,
        stmt_id: StmtId,
        prev_op_time: OpTime,
        document: serde_json::Value,
    ) -> Self {
        Self {
            commit_marker: true,
            ..Self::for_statement(session_id, txn_number, stmt_id, prev_op_time, document)
        }
    }
}

/// The log itself; owned by the engine
#[derive(Debug, Default)]
pub(crate) struct Oplog {
    entries: BTreeMap<OpTime, OplogEntry>,
}

impl Oplog {
    pub(crate) fn insert(&mut self, entry: OplogEntry) {
        self.entries.insert(entry.op_time, entry);
    }

    /// Drop all entries before `op_time`, modeling history loss
    pub(crate) fn truncate_before(&mut self, op_time: OpTime) {
        self.entries.retain(|t, _| *t >= op_time);
    }

    pub(crate) fn get(&self, op_time: OpTime) -> Result<OplogEntry> {
        // A chain link pointing at a missing entry means the history it
        // referenced no longer exists.
        self.entries
            .get(&op_time)
            .cloned()
            .ok_or(StorageError::IncompleteHistory)
    }
}

/// Walks a session's oplog chain backwards from a starting position
pub struct OplogChainIterator {
    engine: Arc<StorageEngine>,
    next_op_time: Option<OpTime>,
}

impl OplogChainIterator {
    pub fn new(engine: Arc<StorageEngine>, start: OpTime) -> Self {
        let next_op_time = if start.is_null() { None } else { Some(start) };
        Self {
            engine,
            next_op_time,
        }
    }

    pub fn has_next(&self) -> bool {
        self.next_op_time.is_some()
    }

    /// Fetch the next (older) entry in the chain
    pub fn next(&mut self) -> Result<OplogEntry> {
        let op_time = self
            .next_op_time
            .take()
            .expect("next() called on an exhausted oplog chain");

        let entry = self.engine.oplog_entry(op_time)?;
        self.next_op_time = entry.prev_op_time.filter(|t| !t.is_null());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StorageConfig;
    use serde_json::json;

    fn chain_of(engine: &Arc<StorageEngine>, len: usize) -> (SessionId, OpTime) {
        let sid = SessionId::new();
        let txn = TxnNumber::new(1);
        let mut prev = OpTime::null();
        for i in 0..len {
            let entry = OplogEntry::for_statement(
                sid,
                txn,
                StmtId::new(i as i32),
                prev,
                json!({"i": i}),
            );
            prev = engine.append_oplog(entry);
        }
        (sid, prev)
    }

    #[test]
    fn test_walk_full_chain() {
        let engine = StorageEngine::new(StorageConfig::default());
        let (_sid, head) = chain_of(&engine, 3);

        let mut it = OplogChainIterator::new(engine, head);
        let mut stmt_ids = Vec::new();
        while it.has_next() {
            stmt_ids.push(it.next().unwrap().stmt_id.unwrap().get());
        }
        assert_eq!(stmt_ids, vec![2, 1, 0]);
    }

    #[test]
    fn test_null_start_is_empty() {
        let engine = StorageEngine::new(StorageConfig::default());
        let it = OplogChainIterator::new(engine, OpTime::null());
        assert!(!it.has_next());
    }

    #[test]
    fn test_truncation_surfaces_incomplete_history() {
        let engine = StorageEngine::new(StorageConfig::default());
        let (_sid, head) = chain_of(&engine, 3);

        // Truncate everything but the head entry.
        engine.truncate_oplog_before(head);

        let mut it = OplogChainIterator::new(engine, head);
        assert!(it.next().is_ok());
        assert!(it.has_next());
        assert_eq!(it.next(), Err(StorageError::IncompleteHistory));
    }
}
