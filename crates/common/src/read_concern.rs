//! Read concern arguments captured when an operation enters the system

use crate::OpTime;
use serde::{Deserialize, Serialize};

/// Isolation level requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConcernLevel {
    /// Read the node's most recent data
    Local,
    /// Read data acknowledged by a majority of the replica set
    Majority,
    /// Read from a single point-in-time snapshot
    Snapshot,
}

/// Read concern as specified on a command
///
/// Distinguishes "nothing was specified" from an explicit level: only the
/// first command of a transaction may carry a non-empty read concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadConcernArgs {
    /// Explicitly requested level, if any
    pub level: Option<ReadConcernLevel>,

    /// Causal-consistency floor: read no earlier than this op-time
    pub after: Option<OpTime>,
}

impl ReadConcernArgs {
    pub fn new(level: ReadConcernLevel) -> Self {
        Self {
            level: Some(level),
            after: None,
        }
    }

    /// True when the client specified nothing at all
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.after.is_none()
    }

    /// The level to act on, defaulting to `Local`
    pub fn effective_level(&self) -> ReadConcernLevel {
        self.level.unwrap_or(ReadConcernLevel::Local)
    }
}
