//! Failure injection points
//!
//! A failpoint is a named process-wide switch tests flip to inject failures
//! at specific points in the write path. Data attached when enabling a
//! point parameterizes the injected behavior.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One named failure-injection point
pub struct FailPoint {
    enabled: AtomicBool,
    data: Mutex<serde_json::Value>,
}

impl FailPoint {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            data: Mutex::new(serde_json::Value::Null),
        }
    }

    /// Enable with parameter data
    pub fn enable(&self, data: serde_json::Value) {
        *self.data.lock() = data;
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Enable with no parameter data
    pub fn enable_default(&self) {
        self.enable(serde_json::Value::Null);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        *self.data.lock() = serde_json::Value::Null;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn data(&self) -> serde_json::Value {
        self.data.lock().clone()
    }

    /// Block the calling thread until the point is disabled
    pub fn pause_while_set(&self) {
        while self.is_enabled() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

impl Default for FailPoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires after each retryable write registers its session-record update.
/// Parameters, combinable unless noted:
///
/// - `closeConnection` (bool, default true): close the connection the write
///   ran on.
/// - `failBeforeCommitErrorCode` (int): raise this error code so the write
///   does not commit; when absent the write commits normally.
pub static ON_PRIMARY_TRANSACTIONAL_WRITE: Lazy<FailPoint> = Lazy::new(FailPoint::new);

/// Pauses an operation just after it materializes a point-in-time snapshot
pub static HANG_AFTER_PREALLOCATE_SNAPSHOT: Lazy<FailPoint> = Lazy::new(FailPoint::new);
