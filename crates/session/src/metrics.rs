//! Server-wide transaction counters
//!
//! Counters are updated without the session mutex held in a few places, so
//! slight transient inaccuracies between related counters are accepted.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters over all multi-statement transactions on this process
#[derive(Debug, Default)]
pub struct TransactionsMetrics {
    current_open: AtomicI64,
    current_active: AtomicI64,
    current_inactive: AtomicI64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
}

impl TransactionsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_open(&self) -> i64 {
        self.current_open.load(Ordering::SeqCst)
    }

    pub fn current_active(&self) -> i64 {
        self.current_active.load(Ordering::SeqCst)
    }

    pub fn current_inactive(&self) -> i64 {
        self.current_inactive.load(Ordering::SeqCst)
    }

    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::SeqCst)
    }

    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::SeqCst)
    }

    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::SeqCst)
    }

    pub fn increment_current_open(&self) {
        self.current_open.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_current_open(&self) {
        self.current_open.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn increment_current_active(&self) {
        self.current_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_current_active(&self) {
        self.current_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn increment_current_inactive(&self) {
        self.current_inactive.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_current_inactive(&self) {
        self.current_inactive.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn increment_total_started(&self) {
        self.total_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_total_committed(&self) {
        self.total_committed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_total_aborted(&self) {
        self.total_aborted.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counters for the retryable-writes machinery
#[derive(Debug, Default)]
pub struct RetryableWritesStats {
    transactions_collection_write_count: AtomicU64,
}

impl RetryableWritesStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions_collection_write_count(&self) -> u64 {
        self.transactions_collection_write_count
            .load(Ordering::SeqCst)
    }

    pub fn increment_transactions_collection_write_count(&self) {
        self.transactions_collection_write_count
            .fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_move_both_ways() {
        let metrics = TransactionsMetrics::new();
        metrics.increment_current_open();
        metrics.increment_current_open();
        metrics.decrement_current_open();
        assert_eq!(metrics.current_open(), 1);

        metrics.increment_total_started();
        assert_eq!(metrics.total_started(), 1);
    }

    #[test]
    fn test_retryable_writes_counter() {
        let stats = RetryableWritesStats::new();
        stats.increment_transactions_collection_write_count();
        assert_eq!(stats.transactions_collection_write_count(), 1);
    }
}
