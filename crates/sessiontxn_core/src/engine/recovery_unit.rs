//! Storage transactions with commit and rollback hooks.

use super::StorageEngine;
use crate::error::{CoreError, CoreResult};
use crate::oplog::OplogEntry;
use crate::session_table::StagedTableUpdate;
use crate::types::OpTime;
use std::fmt;
use std::mem;
use std::sync::Arc;
use tracing::{debug, trace};

/// Identifies a [`RecoveryUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecoveryUnitId(pub(crate) u64);

impl fmt::Display for RecoveryUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ru:{}", self.0)
    }
}

/// Work deferred until a unit of work resolves.
///
/// Exactly one of the two methods runs, once.
pub trait Change: Send {
    /// Runs after the unit of work's writes are durable.
    ///
    /// # Errors
    ///
    /// An error here is reported by the commit that ran it; the writes
    /// stay committed.
    fn commit(self: Box<Self>) -> CoreResult<()>;

    /// Runs when the unit of work is abandoned.
    fn rollback(self: Box<Self>);
}

struct OnCommit<F>(F);

impl<F> Change for OnCommit<F>
where
    F: FnOnce() -> CoreResult<()> + Send,
{
    fn commit(self: Box<Self>) -> CoreResult<()> {
        (self.0)()
    }

    fn rollback(self: Box<Self>) {}
}

struct OnRollback<F>(F);

impl<F> Change for OnRollback<F>
where
    F: FnOnce() + Send,
{
    fn commit(self: Box<Self>) -> CoreResult<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        (self.0)();
    }
}

/// A storage transaction.
///
/// Writes are staged and applied together by
/// [`RecoveryUnit::commit_unit_of_work`]; nothing is visible before that.
/// Dropping a unit that is still open abandons it.
pub struct RecoveryUnit {
    id: RecoveryUnitId,
    engine: Arc<StorageEngine>,
    active: bool,
    snapshot: Option<OpTime>,
    oplog_writes: Vec<OplogEntry>,
    table_writes: Vec<StagedTableUpdate>,
    changes: Vec<Box<dyn Change>>,
}

impl RecoveryUnit {
    pub(crate) fn new(id: RecoveryUnitId, engine: Arc<StorageEngine>) -> Self {
        Self {
            id,
            engine,
            active: false,
            snapshot: None,
            oplog_writes: Vec::new(),
            table_writes: Vec::new(),
            changes: Vec::new(),
        }
    }

    /// Identity of this unit.
    #[must_use]
    pub const fn id(&self) -> RecoveryUnitId {
        self.id
    }

    /// True between begin and commit/abort.
    #[must_use]
    pub const fn in_unit_of_work(&self) -> bool {
        self.active
    }

    /// Read point chosen by [`RecoveryUnit::preallocate_snapshot`].
    #[must_use]
    pub const fn snapshot(&self) -> Option<OpTime> {
        self.snapshot
    }

    /// Number of staged writes.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.oplog_writes.len() + self.table_writes.len()
    }

    pub(crate) fn begin_unit_of_work(&mut self) -> CoreResult<()> {
        if self.active {
            return Err(CoreError::invalid_operation(format!(
                "{} is already in a unit of work",
                self.id
            )));
        }
        self.active = true;
        trace!(ru = %self.id, "begin unit of work");
        Ok(())
    }

    /// Pins the read point at the newest committed oplog position.
    pub fn preallocate_snapshot(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.engine.oplog().last_applied());
        }
    }

    /// Registers deferred work.
    pub fn register_change(&mut self, change: Box<dyn Change>) {
        self.changes.push(change);
    }

    /// Runs `f` after a successful commit.
    pub fn on_commit<F>(&mut self, f: F)
    where
        F: FnOnce() -> CoreResult<()> + Send + 'static,
    {
        self.register_change(Box::new(OnCommit(f)));
    }

    /// Runs `f` if the unit is abandoned.
    pub fn on_rollback<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_change(Box::new(OnRollback(f)));
    }

    fn ensure_active(&self) -> CoreResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(CoreError::invalid_operation(format!(
                "{} is not in a unit of work",
                self.id
            )))
        }
    }

    /// Stages an oplog entry.
    ///
    /// # Errors
    ///
    /// Returns an error outside a unit of work.
    pub fn stage_oplog_entry(&mut self, entry: OplogEntry) -> CoreResult<()> {
        self.ensure_active()?;
        self.oplog_writes.push(entry);
        Ok(())
    }

    pub(crate) fn stage_table_update(&mut self, update: StagedTableUpdate) -> CoreResult<()> {
        self.ensure_active()?;
        self.table_writes.push(update);
        Ok(())
    }

    /// Applies staged writes, then runs commit handlers in registration
    /// order.
    ///
    /// If the writes cannot be applied the unit is rolled back instead and
    /// the write error is returned. If a commit handler fails, the remaining
    /// handlers still run and the first handler error is returned.
    pub(crate) fn commit_unit_of_work(&mut self) -> CoreResult<()> {
        self.ensure_active()?;
        let oplog_writes = mem::take(&mut self.oplog_writes);
        let table_writes = mem::take(&mut self.table_writes);
        let changes = mem::take(&mut self.changes);
        self.active = false;
        self.snapshot = None;

        if let Err(e) = self.engine.commit_staged(&oplog_writes, &table_writes) {
            debug!(ru = %self.id, error = %e, "commit failed, rolling back");
            run_rollbacks(changes);
            return Err(e);
        }
        trace!(ru = %self.id, writes = oplog_writes.len() + table_writes.len(), "committed");

        let mut first_error = None;
        for change in changes {
            if let Err(e) = change.commit() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Discards staged writes and runs rollback handlers newest first.
    pub(crate) fn abort_unit_of_work(&mut self) {
        if !self.active {
            return;
        }
        self.oplog_writes.clear();
        self.table_writes.clear();
        let changes = mem::take(&mut self.changes);
        self.active = false;
        self.snapshot = None;
        trace!(ru = %self.id, "aborted unit of work");
        run_rollbacks(changes);
    }
}

fn run_rollbacks(changes: Vec<Box<dyn Change>>) {
    for change in changes.into_iter().rev() {
        change.rollback();
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        self.abort_unit_of_work();
    }
}

impl fmt::Debug for RecoveryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryUnit")
            .field("id", &self.id)
            .field("active", &self.active)
            .field("snapshot", &self.snapshot)
            .field("pending_writes", &self.pending_writes())
            .finish_non_exhaustive()
    }
}
