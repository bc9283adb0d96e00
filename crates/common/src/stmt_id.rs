//! Statement ids for retryable writes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one statement inside a retryable-write session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StmtId(i32);

impl StmtId {
    /// Sentinel written as a dead-end placeholder when older history was
    /// truncated. Statements carrying this id are never re-executable.
    pub const INCOMPLETE_HISTORY: StmtId = StmtId(i32::MIN);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn get(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
