//! Per-operation state: locker, recovery unit, read concern, kill flag.

use super::locker::{LockMode, Locker, LockerId, ResourceId};
use super::read_concern::ReadConcernArgs;
use super::recovery_unit::{RecoveryUnit, RecoveryUnitId};
use super::StorageEngine;
use crate::error::{CoreError, CoreResult};
use crate::types::{LogicalSessionId, TxnNumber};
use parking_lot::{Mutex, MutexGuard};
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a client is currently running with, as seen by observers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Locker attached to the client's operation.
    pub locker: Option<LockerId>,
    /// Recovery unit attached to the client's operation.
    pub recovery_unit: Option<RecoveryUnitId>,
}

/// A connection. Its mutex is always taken before any session mutex.
#[derive(Debug)]
pub struct Client {
    desc: String,
    info: Mutex<ClientInfo>,
}

impl Client {
    /// Creates a client.
    pub fn new(desc: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            desc: desc.into(),
            info: Mutex::new(ClientInfo::default()),
        })
    }

    /// Human-readable description.
    #[must_use]
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Locks the client.
    pub fn lock(&self) -> MutexGuard<'_, ClientInfo> {
        self.info.lock()
    }
}

/// Handle that kills an operation from another thread.
#[derive(Debug, Clone)]
pub struct KillHandle(Arc<AtomicBool>);

impl KillHandle {
    /// Marks the operation killed; blocking waits return
    /// [`CoreError::Interrupted`].
    pub fn kill(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Everything one operation runs with.
pub struct OperationContext {
    client: Arc<Client>,
    engine: Arc<StorageEngine>,
    session_id: Option<LogicalSessionId>,
    txn_number: Option<TxnNumber>,
    locker: Locker,
    recovery_unit: RecoveryUnit,
    read_concern: ReadConcernArgs,
    has_stashed_cursor: bool,
    killed: Arc<AtomicBool>,
}

impl OperationContext {
    /// Creates a context on `client` with a fresh locker and recovery unit.
    pub fn new(client: Arc<Client>, engine: &Arc<StorageEngine>) -> Self {
        let opctx = Self {
            locker: engine.new_locker(),
            recovery_unit: engine.new_recovery_unit(),
            client,
            engine: Arc::clone(engine),
            session_id: None,
            txn_number: None,
            read_concern: ReadConcernArgs::default(),
            has_stashed_cursor: false,
            killed: Arc::new(AtomicBool::new(false)),
        };
        opctx.publish(&mut opctx.client.lock());
        opctx
    }

    /// Attaches a session and transaction number.
    #[must_use]
    pub fn with_session(mut self, session_id: LogicalSessionId, txn_number: TxnNumber) -> Self {
        self.session_id = Some(session_id);
        self.txn_number = Some(txn_number);
        self
    }

    /// Sets the read concern.
    #[must_use]
    pub fn with_read_concern(mut self, read_concern: ReadConcernArgs) -> Self {
        self.read_concern = read_concern;
        self
    }

    /// Owning client.
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Engine this operation runs against.
    #[must_use]
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Session of the operation, if any.
    #[must_use]
    pub const fn session_id(&self) -> Option<LogicalSessionId> {
        self.session_id
    }

    /// Transaction number of the operation, if any.
    #[must_use]
    pub const fn txn_number(&self) -> Option<TxnNumber> {
        self.txn_number
    }

    pub(crate) fn require_txn_number(&self) -> CoreResult<TxnNumber> {
        self.txn_number.ok_or_else(|| {
            CoreError::invalid_operation("operation does not carry a transaction number")
        })
    }

    /// Current locker.
    #[must_use]
    pub const fn locker(&self) -> &Locker {
        &self.locker
    }

    /// Current locker, mutably.
    pub fn locker_mut(&mut self) -> &mut Locker {
        &mut self.locker
    }

    /// Current recovery unit.
    #[must_use]
    pub const fn recovery_unit(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    /// Current recovery unit, mutably.
    pub fn recovery_unit_mut(&mut self) -> &mut RecoveryUnit {
        &mut self.recovery_unit
    }

    /// Current read concern.
    #[must_use]
    pub const fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }

    /// Replaces the read concern.
    pub fn set_read_concern(&mut self, read_concern: ReadConcernArgs) {
        self.read_concern = read_concern;
    }

    pub(crate) fn take_read_concern(&mut self) -> ReadConcernArgs {
        mem::take(&mut self.read_concern)
    }

    /// Whether a cursor opened by this operation will outlive it.
    #[must_use]
    pub const fn has_stashed_cursor(&self) -> bool {
        self.has_stashed_cursor
    }

    /// Marks that a cursor will outlive this operation.
    pub fn set_has_stashed_cursor(&mut self, value: bool) {
        self.has_stashed_cursor = value;
    }

    /// Handle for killing this operation.
    #[must_use]
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle(Arc::clone(&self.killed))
    }

    /// Fails if the operation has been killed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Interrupted`] after [`KillHandle::kill`].
    pub fn check_for_interrupt(&self) -> CoreResult<()> {
        if self.killed.load(Ordering::Acquire) {
            Err(CoreError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Takes a lock, acquiring an execution ticket first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Interrupted`] if killed while waiting for a ticket.
    pub fn lock(&mut self, resource: ResourceId, mode: LockMode) -> CoreResult<()> {
        self.acquire_ticket()?;
        self.locker.lock(resource, mode);
        Ok(())
    }

    pub(crate) fn acquire_ticket(&mut self) -> CoreResult<()> {
        let tickets = Arc::clone(self.engine.tickets());
        let slice = self.engine.config().ticket_wait_slice;
        self.locker.acquire_ticket(&tickets, &self.killed, slice)
    }

    /// Acquires a ticket for a locker not yet attached to this operation,
    /// honoring this operation's kill flag.
    pub(crate) fn acquire_ticket_for(&self, locker: &mut Locker) -> CoreResult<()> {
        locker.acquire_ticket(
            self.engine.tickets(),
            &self.killed,
            self.engine.config().ticket_wait_slice,
        )
    }

    /// True while a write unit of work is open.
    #[must_use]
    pub const fn in_write_unit_of_work(&self) -> bool {
        self.recovery_unit.in_unit_of_work()
    }

    /// Opens a write unit of work; returns whether it is the outermost.
    pub(crate) fn begin_write_unit_of_work(&mut self) -> CoreResult<bool> {
        let top_level = !self.recovery_unit.in_unit_of_work();
        if top_level {
            self.recovery_unit.begin_unit_of_work()?;
        }
        self.locker.begin_write_unit_of_work();
        Ok(top_level)
    }

    /// Commits the outermost write unit of work.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the writes could not be applied, or the
    /// first commit handler error.
    pub fn commit_write_unit_of_work(&mut self) -> CoreResult<()> {
        let result = self.recovery_unit.commit_unit_of_work();
        self.locker.end_write_unit_of_work();
        result
    }

    /// Abandons the open write unit of work, running rollback handlers.
    pub fn abort_write_unit_of_work(&mut self) {
        if self.recovery_unit.in_unit_of_work() {
            self.recovery_unit.abort_unit_of_work();
            self.locker.abandon_write_unit_of_work();
        }
    }

    pub(crate) fn swap_locker(&mut self, locker: Locker) -> Locker {
        mem::replace(&mut self.locker, locker)
    }

    pub(crate) fn swap_recovery_unit(&mut self, recovery_unit: RecoveryUnit) -> RecoveryUnit {
        mem::replace(&mut self.recovery_unit, recovery_unit)
    }

    /// Records the current locker and recovery unit on the client.
    pub(crate) fn publish(&self, info: &mut ClientInfo) {
        info.locker = Some(self.locker.id());
        info.recovery_unit = Some(self.recovery_unit.id());
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        self.abort_write_unit_of_work();
    }
}

/// Scoped write unit of work.
///
/// Abandons its writes on drop unless [`WriteUnitOfWork::commit`] was
/// called. Nested units only commit with the outermost one; dropping a
/// nested unit uncommitted abandons the whole storage transaction.
pub struct WriteUnitOfWork<'a> {
    opctx: &'a mut OperationContext,
    top_level: bool,
    finished: bool,
}

impl<'a> WriteUnitOfWork<'a> {
    /// Opens a unit of work on `opctx`.
    ///
    /// # Errors
    ///
    /// Returns an error if the recovery unit cannot begin.
    pub fn new(opctx: &'a mut OperationContext) -> CoreResult<Self> {
        let top_level = opctx.begin_write_unit_of_work()?;
        Ok(Self {
            opctx,
            top_level,
            finished: false,
        })
    }

    /// Whether this is the outermost unit.
    #[must_use]
    pub const fn is_top_level(&self) -> bool {
        self.top_level
    }

    /// Commits; a nested unit only closes its nesting level.
    ///
    /// # Errors
    ///
    /// Returns the commit error of the outermost unit.
    pub fn commit(mut self) -> CoreResult<()> {
        self.finished = true;
        if self.top_level {
            self.opctx.commit_write_unit_of_work()
        } else {
            self.opctx.locker.end_write_unit_of_work();
            Ok(())
        }
    }
}

impl Deref for WriteUnitOfWork<'_> {
    type Target = OperationContext;

    fn deref(&self) -> &Self::Target {
        self.opctx
    }
}

impl DerefMut for WriteUnitOfWork<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.opctx
    }
}

impl Drop for WriteUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.opctx.abort_write_unit_of_work();
        }
    }
}
