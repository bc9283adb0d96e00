//! Op-times: positions in the durable replication log

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in the durable replication log
///
/// Op-times order first by timestamp, then by election term. The default
/// value is the null op-time, used where no position has been recorded yet.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    /// Logical timestamp assigned by the storage clock at log time
    pub ts: Timestamp,

    /// Election term of the primary that logged the entry
    pub term: u64,
}

impl OpTime {
    pub const fn new(ts: Timestamp, term: u64) -> Self {
        Self { ts, term }
    }

    /// The null op-time: no position recorded
    pub const fn null() -> Self {
        Self {
            ts: Timestamp::MIN,
            term: 0,
        }
    }

    pub const fn is_null(&self) -> bool {
        self.ts.is_zero() && self.term == 0
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ts: {}, term: {}}}", self.ts, self.term)
    }
}
