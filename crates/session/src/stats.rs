//! Per-transaction statistics
//!
//! One `SingleTransactionStats` instance tracks a multi-statement
//! transaction from start to terminal state: wall-clock duration, the
//! active/inactive split across stash boundaries, aggregated operation
//! debug metrics and the last client that ran an operation on the session.

use crate::context::{Client, OpDebug};
use papyrus_common::Timestamp;

/// The last client that ran a transaction operation on a session
#[derive(Debug, Clone)]
pub struct LastClientInfo {
    pub client_desc: String,
    pub connection_id: u64,
    pub app_name: String,
}

/// Metrics for one multi-statement transaction
#[derive(Debug)]
pub struct SingleTransactionStats {
    start_time: Timestamp,
    end_time: Option<Timestamp>,
    /// When the current active period began, if the transaction is active
    active_since: Option<Timestamp>,
    /// Total time spent active in completed periods
    time_active_micros: u64,
    op_debug: OpDebug,
    last_client_info: Option<LastClientInfo>,
}

impl SingleTransactionStats {
    pub fn new(start_time: Timestamp) -> Self {
        Self {
            start_time,
            end_time: None,
            active_since: None,
            time_active_micros: 0,
            op_debug: OpDebug::default(),
            last_client_info: None,
        }
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn set_end_time(&mut self, now: Timestamp) {
        self.end_time = Some(now);
    }

    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    pub fn set_active(&mut self, now: Timestamp) {
        self.active_since = Some(now);
    }

    pub fn set_inactive(&mut self, now: Timestamp) {
        if let Some(since) = self.active_since.take() {
            self.time_active_micros += now.micros_since(since);
        }
    }

    /// Total time the transaction has been open
    pub fn duration_micros(&self, now: Timestamp) -> u64 {
        self.end_time.unwrap_or(now).micros_since(self.start_time)
    }

    pub fn time_active_micros(&self, now: Timestamp) -> u64 {
        let running = self
            .active_since
            .map(|since| now.micros_since(since))
            .unwrap_or(0);
        self.time_active_micros + running
    }

    pub fn time_inactive_micros(&self, now: Timestamp) -> u64 {
        self.duration_micros(now)
            .saturating_sub(self.time_active_micros(now))
    }

    pub fn op_debug(&self) -> &OpDebug {
        &self.op_debug
    }

    pub fn op_debug_mut(&mut self) -> &mut OpDebug {
        &mut self.op_debug
    }

    pub fn update_last_client_info(&mut self, client: &Client) {
        self.last_client_info = Some(LastClientInfo {
            client_desc: client.desc().to_string(),
            connection_id: client.id(),
            app_name: client.app_name().to_string(),
        });
    }

    pub fn last_client_info(&self) -> Option<&LastClientInfo> {
        self.last_client_info.as_ref()
    }
}
