//! Recovery units: snapshot-bound handles with two-phase units of work
//!
//! A recovery unit is bound to at most one point-in-time snapshot. Writes
//! buffer inside the unit and become visible atomically when the unit of
//! work commits. Units of work nest: inner commits only decrement the
//! nesting level, the outermost commit applies the batch. Commit hooks run
//! only when the batch really commits, never on rollback.

use crate::engine::StorageEngine;
use crate::error::Result;
use papyrus_common::Timestamp;
use std::sync::Arc;

/// Where a recovery unit pins its snapshot when first needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// The newest committed data on this node
    Latest,
    /// The position the replication subsystem has applied through
    LastApplied,
    /// An explicit timestamp
    Provided(Timestamp),
}

/// One buffered write inside a unit of work
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub collection: String,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

type CommitHook = Box<dyn FnOnce(Option<Timestamp>) + Send>;

/// Storage handle bound to one snapshot, with a two-phase unit of work
pub struct RecoveryUnit {
    engine: Arc<StorageEngine>,
    read_source: ReadSource,
    snapshot: Option<Timestamp>,
    snapshot_id: u64,
    pending: Vec<PendingWrite>,
    on_commit: Vec<CommitHook>,
    unit_depth: u32,
    prepared: bool,
    prepare_ts: Option<Timestamp>,
    commit_ts: Option<Timestamp>,
}

impl RecoveryUnit {
    pub(crate) fn new(engine: Arc<StorageEngine>) -> Self {
        let snapshot_id = engine.next_snapshot_id();
        Self {
            engine,
            read_source: ReadSource::Latest,
            snapshot: None,
            snapshot_id,
            pending: Vec::new(),
            on_commit: Vec::new(),
            unit_depth: 0,
            prepared: false,
            prepare_ts: None,
            commit_ts: None,
        }
    }

    /// Select the snapshot source for the next pin. Resets any existing
    /// snapshot.
    pub fn set_timestamp_read_source(&mut self, source: ReadSource) {
        assert!(
            self.pending.is_empty(),
            "cannot change the read source with buffered writes"
        );
        self.read_source = source;
        self.reset_snapshot();
    }

    /// Force a point-in-time snapshot to exist now instead of at first read
    pub fn preallocate_snapshot(&mut self) {
        self.pin_snapshot();
    }

    /// The pinned point-in-time read timestamp, if a snapshot exists
    pub fn read_timestamp(&self) -> Option<Timestamp> {
        self.snapshot
    }

    /// Identity of the current snapshot; changes whenever the snapshot does
    pub fn snapshot_id(&self) -> u64 {
        self.snapshot_id
    }

    pub fn begin_unit_of_work(&mut self) {
        self.unit_depth += 1;
    }

    pub fn in_unit_of_work(&self) -> bool {
        self.unit_depth > 0
    }

    /// Read `key` at this unit's snapshot, seeing its own buffered writes
    pub fn find(&mut self, collection: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = self.pin_snapshot();
        if let Some(write) = self
            .pending
            .iter()
            .rev()
            .find(|w| w.collection == collection && w.key == key)
        {
            return Ok(write.value.clone());
        }
        self.engine.read_at(collection, key, snapshot)
    }

    /// Buffer an insert. Fails with `DuplicateKey` if the key is live at the
    /// newest committed version, or `WriteConflict` if the key changed after
    /// this unit's snapshot.
    pub fn insert(&mut self, collection: &str, key: &[u8], value: Vec<u8>) -> Result<()> {
        assert!(self.unit_depth > 0, "insert outside a unit of work");
        let snapshot = self.pin_snapshot();
        self.engine
            .check_insertable(collection, key, snapshot)?;
        self.pending.push(PendingWrite {
            collection: collection.to_string(),
            key: key.to_vec(),
            value: Some(value),
        });
        Ok(())
    }

    /// Buffer an in-place replacement. Fails with `WriteConflict` if the key
    /// changed after this unit's snapshot.
    pub fn update(&mut self, collection: &str, key: &[u8], value: Vec<u8>) -> Result<()> {
        assert!(self.unit_depth > 0, "update outside a unit of work");
        let snapshot = self.pin_snapshot();
        self.engine.check_updatable(collection, key, snapshot)?;
        self.pending.push(PendingWrite {
            collection: collection.to_string(),
            key: key.to_vec(),
            value: Some(value),
        });
        Ok(())
    }

    /// Register a hook to run if and when the unit of work commits. The hook
    /// receives the explicit commit timestamp when one was bound.
    pub fn on_commit(&mut self, hook: impl FnOnce(Option<Timestamp>) + Send + 'static) {
        self.on_commit.push(Box::new(hook));
    }

    /// Bind the commit timestamp for a prepared transaction
    pub fn set_commit_timestamp(&mut self, ts: Timestamp) {
        self.commit_ts = Some(ts);
    }

    /// First phase of a two-phase commit. The unit stays open; only an
    /// explicit commit or abort resolves it.
    pub fn prepare_unit_of_work(&mut self) -> Result<Timestamp> {
        assert!(self.unit_depth > 0, "prepare outside a unit of work");
        let ts = self.engine.tick();
        self.prepared = true;
        self.prepare_ts = Some(ts);
        Ok(ts)
    }

    /// Timestamp assigned by the prepare phase
    pub fn prepare_timestamp(&self) -> Option<Timestamp> {
        self.prepare_ts
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Commit the unit of work. Inner (nested) commits only unwind the
    /// nesting; the outermost commit validates and applies the batch, then
    /// runs commit hooks. A failed apply leaves the unit aborted.
    pub fn commit_unit_of_work(&mut self) -> Result<()> {
        assert!(self.unit_depth > 0, "commit outside a unit of work");
        if self.unit_depth > 1 {
            self.unit_depth -= 1;
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        let commit_ts = self.commit_ts;
        let snapshot = self.snapshot;
        let result = self.engine.commit_writes(&pending, commit_ts, snapshot);

        let hooks = std::mem::take(&mut self.on_commit);
        self.finish_unit();

        match result {
            Ok(_version) => {
                for hook in hooks {
                    hook(commit_ts);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Abort the unit of work, discarding buffered writes and hooks
    pub fn abort_unit_of_work(&mut self) {
        self.pending.clear();
        self.on_commit.clear();
        self.finish_unit();
    }

    fn pin_snapshot(&mut self) -> Timestamp {
        match self.snapshot {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = self.engine.snapshot_for(self.read_source);
                self.snapshot = Some(snapshot);
                snapshot
            }
        }
    }

    fn reset_snapshot(&mut self) {
        self.snapshot = None;
        self.snapshot_id = self.engine.next_snapshot_id();
    }

    fn finish_unit(&mut self) {
        self.unit_depth = 0;
        self.prepared = false;
        self.prepare_ts = None;
        self.commit_ts = None;
        self.reset_snapshot();
    }
}
