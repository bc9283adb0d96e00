//! Per-session transaction numbers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically non-decreasing transaction number within one session
///
/// A strictly greater number starts a new transaction on the session, an
/// equal number continues the current one and a smaller number is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnNumber(i64);

impl TxnNumber {
    /// Sentinel for a session that has not yet seen any transaction
    pub const UNINITIALIZED: TxnNumber = TxnNumber(-1);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
