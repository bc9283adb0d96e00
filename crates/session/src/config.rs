//! Runtime-adjustable parameters for the session subsystem

use crate::error::{Result, SessionError};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

/// Parameters governing transaction lifetime and lock behavior
///
/// All fields are adjustable at runtime; controllers share one instance via
/// `Arc` and read the current values at each decision point.
#[derive(Debug)]
pub struct SessionConfig {
    /// Lifetime given to each transaction, in seconds. Transactions must
    /// eventually expire to keep storage cache pressure from immobilizing
    /// the system.
    transaction_lifetime_limit_secs: AtomicI64,

    /// Max milliseconds any transaction lock request will wait. A small cap
    /// bounds the deadlock window while still letting fast metadata
    /// operations run without aborting transactions. Negative disables the
    /// cap.
    max_transaction_lock_request_timeout_millis: AtomicI64,

    /// Admits the test-only command allow-list
    test_commands_enabled: AtomicBool,

    /// Lifts the rejection of `count` inside transactions
    count_in_transactions_allowed: AtomicBool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transaction_lifetime_limit_secs: AtomicI64::new(60),
            max_transaction_lock_request_timeout_millis: AtomicI64::new(5),
            test_commands_enabled: AtomicBool::new(false),
            count_in_transactions_allowed: AtomicBool::new(false),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transaction lifetime at construction time
    pub fn with_transaction_lifetime_limit_secs(self, secs: i64) -> Result<Self> {
        self.set_transaction_lifetime_limit_secs(secs)?;
        Ok(self)
    }

    /// Set the lock-request cap at construction time
    pub fn with_max_transaction_lock_request_timeout_millis(self, millis: i64) -> Self {
        self.set_max_transaction_lock_request_timeout_millis(millis);
        self
    }

    pub fn transaction_lifetime_limit_secs(&self) -> i64 {
        self.transaction_lifetime_limit_secs.load(Ordering::SeqCst)
    }

    pub fn set_transaction_lifetime_limit_secs(&self, secs: i64) -> Result<()> {
        if secs < 1 {
            return Err(SessionError::InvalidOptions(
                "transactionLifetimeLimitSeconds must be greater than or equal to 1s".to_string(),
            ));
        }
        self.transaction_lifetime_limit_secs
            .store(secs, Ordering::SeqCst);
        Ok(())
    }

    /// The lock-request cap as a duration; `None` when disabled
    pub fn max_transaction_lock_request_timeout(&self) -> Option<Duration> {
        let millis = self
            .max_transaction_lock_request_timeout_millis
            .load(Ordering::SeqCst);
        if millis < 0 {
            None
        } else {
            Some(Duration::from_millis(millis as u64))
        }
    }

    pub fn set_max_transaction_lock_request_timeout_millis(&self, millis: i64) {
        self.max_transaction_lock_request_timeout_millis
            .store(millis, Ordering::SeqCst);
    }

    pub fn test_commands_enabled(&self) -> bool {
        self.test_commands_enabled.load(Ordering::SeqCst)
    }

    pub fn set_test_commands_enabled(&self, enabled: bool) {
        self.test_commands_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn count_in_transactions_allowed(&self) -> bool {
        self.count_in_transactions_allowed.load(Ordering::SeqCst)
    }

    pub fn set_count_in_transactions_allowed(&self, allowed: bool) {
        self.count_in_transactions_allowed
            .store(allowed, Ordering::SeqCst);
    }
}
