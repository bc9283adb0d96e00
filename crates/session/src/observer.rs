//! The replication observer seam
//!
//! The controller notifies the replication subsystem at the prepare and
//! commit points of a transaction. Both upcalls run with the session mutex
//! released and may re-enter the controller through the write-completion
//! hooks, so implementations must not assume any session state is stable
//! across the call.

use crate::context::OperationContext;

/// Upcalls into the replication subsystem
pub trait ReplicationObserver: Send + Sync {
    /// The transaction on `op` entered the prepare phase
    fn on_transaction_prepare(&self, op: &mut OperationContext);

    /// The transaction on `op` is committing; `was_prepared` distinguishes
    /// the two-phase path
    fn on_transaction_commit(&self, op: &mut OperationContext, was_prepared: bool);
}

/// Observer that ignores every notification
pub struct NoopReplicationObserver;

impl ReplicationObserver for NoopReplicationObserver {
    fn on_transaction_prepare(&self, _op: &mut OperationContext) {}

    fn on_transaction_commit(&self, _op: &mut OperationContext, _was_prepared: bool) {}
}
