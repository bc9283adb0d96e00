//! Multi-version collections
//!
//! Each key maps to a chain of versions stamped with the commit timestamp
//! that produced them. Snapshot reads return the newest version at or below
//! the snapshot; a `None` value records a delete.

use papyrus_common::Timestamp;
use std::collections::BTreeMap;

/// One committed version of a document
#[derive(Debug, Clone)]
pub(crate) struct VersionedValue {
    pub version: Timestamp,
    /// Encoded document bytes, `None` for a delete marker
    pub value: Option<Vec<u8>>,
}

/// A named multi-version map of encoded documents
#[derive(Debug, Default)]
pub struct Collection {
    chains: BTreeMap<Vec<u8>, Vec<VersionedValue>>,
}

impl Collection {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Newest committed version of `key`, if the key was ever written
    pub(crate) fn latest(&self, key: &[u8]) -> Option<&VersionedValue> {
        self.chains.get(key).and_then(|chain| chain.last())
    }

    /// True when the key exists (not deleted) at the newest version
    pub(crate) fn exists_latest(&self, key: &[u8]) -> bool {
        self.latest(key).map(|v| v.value.is_some()).unwrap_or(false)
    }

    /// Read `key` as of `snapshot`
    pub(crate) fn read_at(&self, key: &[u8], snapshot: Timestamp) -> Option<Vec<u8>> {
        let chain = self.chains.get(key)?;
        chain
            .iter()
            .rev()
            .find(|v| v.version <= snapshot)
            .and_then(|v| v.value.clone())
    }

    /// Apply one committed write at `version`. Versions are assigned by the
    /// engine clock, so chains stay sorted by construction.
    pub(crate) fn apply(&mut self, key: Vec<u8>, value: Option<Vec<u8>>, version: Timestamp) {
        self.chains
            .entry(key)
            .or_default()
            .push(VersionedValue { version, value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(micros: u64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    #[test]
    fn test_snapshot_read_sees_version_at_or_below() {
        let mut col = Collection::new();
        col.apply(b"k".to_vec(), Some(b"v1".to_vec()), ts(10));
        col.apply(b"k".to_vec(), Some(b"v2".to_vec()), ts(20));

        assert_eq!(col.read_at(b"k", ts(5)), None);
        assert_eq!(col.read_at(b"k", ts(10)), Some(b"v1".to_vec()));
        assert_eq!(col.read_at(b"k", ts(15)), Some(b"v1".to_vec()));
        assert_eq!(col.read_at(b"k", ts(20)), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_delete_marker_hides_value() {
        let mut col = Collection::new();
        col.apply(b"k".to_vec(), Some(b"v1".to_vec()), ts(10));
        col.apply(b"k".to_vec(), None, ts(20));

        assert_eq!(col.read_at(b"k", ts(15)), Some(b"v1".to_vec()));
        assert_eq!(col.read_at(b"k", ts(25)), None);
        assert!(!col.exists_latest(b"k"));
    }

    #[test]
    fn test_latest() {
        let mut col = Collection::new();
        assert!(col.latest(b"k").is_none());
        col.apply(b"k".to_vec(), Some(b"v1".to_vec()), ts(10));
        assert_eq!(col.latest(b"k").unwrap().version, ts(10));
        assert!(col.exists_latest(b"k"));
    }
}
