//! Transaction resources: the stash bundle
//!
//! While a multi-statement transaction is parked between network requests,
//! its storage and locking state lives in a `TxnResources` bundle owned by
//! the session's stash slot. Ownership is exclusive: at any instant the
//! recovery unit, locker, write unit and read concern of a transaction
//! belong either to the in-flight operation context or to the stash, never
//! both.

use crate::context::OperationContext;
use crate::error::Result;
use papyrus_common::ReadConcernArgs;
use papyrus_storage::{ClientState, Locker, LockerInfo, RecoveryUnit};
use std::time::Duration;

/// Per-transaction storage and locking state parked between requests
pub(crate) struct TxnResources {
    recovery_unit: Option<Box<RecoveryUnit>>,
    locker: Option<Locker>,
    had_write_unit: bool,
    read_concern: ReadConcernArgs,
    released: bool,
}

impl TxnResources {
    /// Move the transaction's resources off `op` into a new bundle. The
    /// operation is left with a fresh empty locker and recovery unit; the
    /// captured locker gives up its concurrency ticket and thread binding
    /// while parked.
    pub(crate) fn capture(
        op: &mut OperationContext,
        max_lock_timeout: Option<Duration>,
    ) -> TxnResources {
        let had_write_unit = op.take_write_unit_marker();

        let fresh_locker = op.engine().new_locker();
        let mut locker = op.swap_locker(fresh_locker);
        locker.release_ticket();
        locker.unset_thread();

        // The thread keeps running non-transactional work on its fresh
        // locker, and that work must still respect the transaction lock
        // cap: it can block the parked transaction from making progress.
        if let Some(timeout) = max_lock_timeout {
            op.locker().set_max_lock_timeout(timeout);
        }

        let recovery_unit = op.release_recovery_unit();
        let read_concern = op.read_concern().clone();

        TxnResources {
            recovery_unit: Some(recovery_unit),
            locker: Some(locker),
            had_write_unit,
            read_concern,
            released: false,
        }
    }

    /// Move the bundle back onto `op`. The ticket is reacquired before the
    /// bundle is marked consumed, so a failure to reacquire leaves
    /// ownership with the stash. Fails loudly if called twice.
    pub(crate) fn release(&mut self, op: &mut OperationContext) -> Result<()> {
        let locker = self
            .locker
            .as_mut()
            .expect("transaction resources released twice");
        locker.reacquire_ticket()?;

        assert!(!self.released, "transaction resources released twice");
        self.released = true;

        // The empty locker swapped off the operation here is discarded; if
        // the transaction is stashed again a new one takes its place.
        assert_eq!(
            op.locker_ref().client_state(),
            ClientState::Inactive,
            "cannot restore a stash onto an operation holding locks"
        );
        let locker = self.locker.take().expect("locker taken twice");
        op.swap_locker(locker);
        op.locker().bind_to_current_thread();

        let recovery_unit = self
            .recovery_unit
            .take()
            .expect("recovery unit taken twice");
        op.set_recovery_unit(recovery_unit);
        op.restore_write_unit_marker(self.had_write_unit);

        op.set_read_concern(self.read_concern.clone());
        Ok(())
    }

    /// Lock-manager holdings of the parked transaction, for reporting
    pub(crate) fn locker_info(&self) -> Option<LockerInfo> {
        self.locker.as_ref().and_then(|l| l.info())
    }

    pub(crate) fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }
}

impl Drop for TxnResources {
    /// A bundle dropped without release is a transaction discarded while
    /// stashed: the write unit aborts and the locker's grants dissolve
    /// with it. The ticket was already returned at capture, so nothing
    /// leaks and nothing blocks.
    fn drop(&mut self) {
        if !self.released {
            if let Some(mut recovery_unit) = self.recovery_unit.take() {
                recovery_unit.abort_unit_of_work();
            }
        }
    }
}
