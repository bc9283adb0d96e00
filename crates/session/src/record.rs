//! The durable session record and its idempotent writer
//!
//! Each session persists one row in the session-records collection: the
//! last written transaction number, the head of the session's oplog chain
//! and the wall-clock time of that write. The row is written upsert-style
//! from inside the same storage write unit as the user's write, so the
//! record and the data it describes commit or roll back together.

use crate::context::OperationContext;
use crate::error::Result;
use papyrus_common::{OpTime, SessionId, Timestamp, TxnNumber};
use papyrus_storage::{LockMode, RecoveryUnit, StorageError, SESSION_RECORDS_COLLECTION};
use serde::{Deserialize, Serialize};

/// The durable per-session transaction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub txn_number: TxnNumber,
    pub last_write_op_time: OpTime,
    pub last_write_date: Timestamp,
}

impl SessionRecord {
    /// Storage key of the record: the session id itself, as the collection
    /// is keyed by `_id`
    pub fn storage_key(session_id: &SessionId) -> Vec<u8> {
        session_id.to_bytes().to_vec()
    }

    /// Encode for storage
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, StorageError> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| StorageError::Corruption(format!("Failed to encode session record: {e}")))?;
        Ok(bytes)
    }

    /// Decode from storage
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, StorageError> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| StorageError::Corruption(format!("Failed to decode session record: {e}")))
    }
}

/// Upsert `record` into the session-records collection.
///
/// Runs inside its own (nested) unit of work on the operation's recovery
/// unit:
/// 1. Takes the global lock intent-exclusive and requires the collection to
///    exist; a missing collection is a clear, non-retryable error.
/// 2. Point-looks-up the record by session id through the id index.
/// 3. Inserts when absent; a duplicate-key outcome becomes a write conflict
///    so the caller retries at a newer snapshot.
/// 4. When present, re-reads at the unit's snapshot and re-checks the id
///    match; a raced document surfaces as a write conflict.
/// 5. Replaces the document in place. The collection's only index is the
///    id index, so no secondary index is touched.
///
/// Replication of this update rides the triggering user write, not this
/// function.
pub fn update_session_record(op: &mut OperationContext, record: &SessionRecord) -> Result<()> {
    op.locker().lock_global(LockMode::IntentExclusive)?;
    let result = persist_under_lock(op, record);
    op.locker().unlock_global(LockMode::IntentExclusive);
    result
}

fn persist_under_lock(op: &mut OperationContext, record: &SessionRecord) -> Result<()> {
    if !op.engine().collection_exists(SESSION_RECORDS_COLLECTION) {
        return Err(StorageError::CollectionMissing(format!(
            "Unable to persist transaction state because the session transaction \
             collection is missing. This indicates that the {} collection has \
             been manually deleted.",
            SESSION_RECORDS_COLLECTION
        ))
        .into());
    }

    let key = SessionRecord::storage_key(&record.session_id);
    let bytes = record.to_bytes()?;

    let recovery_unit = op.recovery_unit();
    recovery_unit.begin_unit_of_work();
    match upsert(recovery_unit, &key, bytes, record) {
        Ok(()) => {
            recovery_unit.commit_unit_of_work()?;
            Ok(())
        }
        Err(e) => {
            recovery_unit.abort_unit_of_work();
            Err(e.into())
        }
    }
}

fn upsert(
    recovery_unit: &mut RecoveryUnit,
    key: &[u8],
    bytes: Vec<u8>,
    record: &SessionRecord,
) -> std::result::Result<(), StorageError> {
    match recovery_unit.find(SESSION_RECORDS_COLLECTION, key)? {
        None => {
            // Upsert case. Losing an insert race shows up as a duplicate
            // key; surface it as a write conflict to force a retry at a
            // newer snapshot.
            match recovery_unit.insert(SESSION_RECORDS_COLLECTION, key, bytes) {
                Err(StorageError::DuplicateKey(_)) => Err(StorageError::WriteConflict),
                other => other,
            }
        }
        Some(existing) => {
            let existing = SessionRecord::from_bytes(&existing)?;
            if existing.session_id != record.session_id {
                // The document under this key no longer matches the query;
                // another writer raced us.
                return Err(StorageError::WriteConflict);
            }
            recovery_unit.update(SESSION_RECORDS_COLLECTION, key, bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Client;
    use crate::observer::NoopReplicationObserver;
    use papyrus_storage::{StorageConfig, StorageEngine};
    use std::sync::Arc;

    fn make_op(engine: &Arc<StorageEngine>) -> OperationContext {
        let client = Client::new("127.0.0.1:51000", "test");
        OperationContext::new(engine, client, Arc::new(NoopReplicationObserver))
    }

    fn record_for(session_id: SessionId, txn: i64) -> SessionRecord {
        SessionRecord {
            session_id,
            txn_number: TxnNumber::new(txn),
            last_write_op_time: OpTime::new(Timestamp::from_micros(100), 1),
            last_write_date: Timestamp::now(),
        }
    }

    fn read_record(engine: &Arc<StorageEngine>, session_id: &SessionId) -> Option<SessionRecord> {
        let mut ru = engine.new_recovery_unit();
        ru.find(
            SESSION_RECORDS_COLLECTION,
            &SessionRecord::storage_key(session_id),
        )
        .unwrap()
        .map(|bytes| SessionRecord::from_bytes(&bytes).unwrap())
    }

    #[test]
    fn test_encode_roundtrip() {
        let record = record_for(SessionId::new(), 3);
        let decoded = SessionRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_insert_then_replace() {
        let engine = StorageEngine::new(StorageConfig::default());
        let session_id = SessionId::new();

        let mut op = make_op(&engine);
        op.begin_write_unit();
        update_session_record(&mut op, &record_for(session_id, 1)).unwrap();
        op.commit_write_unit().unwrap();

        assert_eq!(
            read_record(&engine, &session_id).unwrap().txn_number,
            TxnNumber::new(1)
        );

        let mut op = make_op(&engine);
        op.begin_write_unit();
        update_session_record(&mut op, &record_for(session_id, 2)).unwrap();
        op.commit_write_unit().unwrap();

        assert_eq!(
            read_record(&engine, &session_id).unwrap().txn_number,
            TxnNumber::new(2)
        );
    }

    #[test]
    fn test_missing_collection_is_a_clear_error() {
        let engine = StorageEngine::new(StorageConfig::default().with_session_records(false));
        let mut op = make_op(&engine);
        op.begin_write_unit();
        let err = update_session_record(&mut op, &record_for(SessionId::new(), 1)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::SessionError::Storage(StorageError::CollectionMissing(_))
        ));
    }

    #[test]
    fn test_stale_snapshot_write_loses_with_write_conflict() {
        let engine = StorageEngine::new(StorageConfig::default());
        let session_id = SessionId::new();

        // Seed the record.
        let mut op = make_op(&engine);
        op.begin_write_unit();
        update_session_record(&mut op, &record_for(session_id, 1)).unwrap();
        op.commit_write_unit().unwrap();

        // Pin a snapshot before the racing writer commits.
        let mut stale_op = make_op(&engine);
        stale_op.begin_write_unit();
        stale_op.recovery_unit().preallocate_snapshot();

        let mut winner = make_op(&engine);
        winner.begin_write_unit();
        update_session_record(&mut winner, &record_for(session_id, 2)).unwrap();
        winner.commit_write_unit().unwrap();

        let err = update_session_record(&mut stale_op, &record_for(session_id, 3)).unwrap_err();
        assert!(err.is_write_conflict());

        // Retry at a fresh snapshot succeeds and lands the higher number.
        stale_op.abort_write_unit();
        stale_op.replace_recovery_unit();
        stale_op.begin_write_unit();
        update_session_record(&mut stale_op, &record_for(session_id, 3)).unwrap();
        stale_op.commit_write_unit().unwrap();

        assert_eq!(
            read_record(&engine, &session_id).unwrap().txn_number,
            TxnNumber::new(3)
        );
    }
}
