//! Parking a multi-statement transaction's resources between statements.

use crate::engine::{
    ClientInfo, Locker, LockerId, OperationContext, ReadConcernArgs, RecoveryUnit, RecoveryUnitId,
};
use crate::error::{CoreError, CoreResult};
use crate::types::OpTime;
use std::fmt;
use std::mem;
use tracing::debug;

/// A transaction's locker, open recovery unit and read concern, detached
/// from any operation.
///
/// Dropping resources that were never released back to an operation
/// abandons the storage transaction.
pub struct TxnResources {
    locker: Option<Locker>,
    recovery_unit: Option<RecoveryUnit>,
    read_concern: ReadConcernArgs,
}

impl TxnResources {
    /// Moves the operation's resources out, leaving it with a fresh locker,
    /// a fresh recovery unit and an empty read concern.
    ///
    /// The stashed locker gives up its execution ticket.
    pub(crate) fn stash(opctx: &mut OperationContext, client: &mut ClientInfo) -> CoreResult<Self> {
        if !opctx.in_write_unit_of_work() {
            return Err(CoreError::invalid_operation(
                "no open storage transaction to stash",
            ));
        }
        let fresh_locker = opctx.engine().new_locker();
        let mut locker = opctx.swap_locker(fresh_locker);
        locker.release_ticket();
        let fresh_unit = opctx.engine().new_recovery_unit();
        let recovery_unit = opctx.swap_recovery_unit(fresh_unit);
        let read_concern = opctx.take_read_concern();
        opctx.publish(client);

        debug!(
            locker = %locker.id(),
            recovery_unit = %recovery_unit.id(),
            "stashed transaction resources"
        );
        Ok(Self {
            locker: Some(locker),
            recovery_unit: Some(recovery_unit),
            read_concern,
        })
    }

    /// Hands the resources to `opctx`.
    ///
    /// On error nothing moves and the resources stay stashed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidOptions`] if the operation carries its own read
    ///   concern; only the first statement of a transaction may set one.
    /// - [`CoreError::Interrupted`] if killed while waiting for a ticket.
    pub(crate) fn release(
        &mut self,
        opctx: &mut OperationContext,
        client: &mut ClientInfo,
    ) -> CoreResult<()> {
        if !opctx.read_concern().is_empty() {
            return Err(CoreError::invalid_options(
                "only the first command in a transaction may specify a readConcern",
            ));
        }
        if opctx.locker().is_locked() || opctx.in_write_unit_of_work() {
            return Err(CoreError::invalid_operation(
                "operation already holds storage resources",
            ));
        }
        let Some(locker) = self.locker.as_mut() else {
            return Err(released_twice());
        };
        opctx.acquire_ticket_for(locker)?;

        let (Some(locker), Some(recovery_unit)) = (self.locker.take(), self.recovery_unit.take())
        else {
            return Err(released_twice());
        };
        debug!(
            locker = %locker.id(),
            recovery_unit = %recovery_unit.id(),
            "unstashed transaction resources"
        );
        drop(opctx.swap_locker(locker));
        drop(opctx.swap_recovery_unit(recovery_unit));
        opctx.set_read_concern(mem::take(&mut self.read_concern));
        opctx.publish(client);
        Ok(())
    }

    /// Stashed locker.
    #[must_use]
    pub fn locker_id(&self) -> Option<LockerId> {
        self.locker.as_ref().map(Locker::id)
    }

    /// Stashed recovery unit.
    #[must_use]
    pub fn recovery_unit_id(&self) -> Option<RecoveryUnitId> {
        self.recovery_unit.as_ref().map(RecoveryUnit::id)
    }

    /// Read point of the stashed recovery unit.
    #[must_use]
    pub fn snapshot(&self) -> Option<OpTime> {
        self.recovery_unit.as_ref().and_then(RecoveryUnit::snapshot)
    }

    /// Stashed read concern.
    #[must_use]
    pub const fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }
}

fn released_twice() -> CoreError {
    CoreError::invalid_operation("transaction resources were already released")
}

impl Drop for TxnResources {
    fn drop(&mut self) {
        if let Some(mut recovery_unit) = self.recovery_unit.take() {
            debug!(
                recovery_unit = %recovery_unit.id(),
                "abandoning unreleased transaction resources"
            );
            recovery_unit.abort_unit_of_work();
            if let Some(locker) = self.locker.as_mut() {
                locker.abandon_write_unit_of_work();
            }
        }
    }
}

impl fmt::Debug for TxnResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnResources")
            .field("locker", &self.locker_id())
            .field("recovery_unit", &self.recovery_unit_id())
            .field("read_concern", &self.read_concern)
            .finish()
    }
}
