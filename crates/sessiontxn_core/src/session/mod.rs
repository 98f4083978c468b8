//! Per-session transaction state.
//!
//! A [`Session`] tracks the session's active transaction number, which of
//! its statements have committed and where, whether a multi-statement
//! transaction is running, and the storage resources such a transaction
//! keeps between statements.
//!
//! The in-memory view is a cache over the session transaction table and
//! the oplog. It is rebuilt by [`Session::refresh_from_storage_if_needed`]
//! after [`Session::invalidate`], and advanced by commit handlers that run
//! only once the corresponding storage write is durable.
//!
//! Lock order: client, then session. Rollback handlers take the session
//! mutex, so nothing that may abandon a recovery unit runs while it is held.

mod catalog;
mod history;
mod stash;

pub use catalog::SessionCatalog;
pub use stash::TxnResources;

use crate::engine::{OperationContext, ReadConcernLevel, StorageEngine};
use crate::error::{CoreError, CoreResult};
use crate::oplog::{OplogEntry, ReplOperation};
use crate::session_table::{SessionTxnRecord, UpdateRequest};
use crate::types::{
    LogicalSessionId, OpTime, StmtId, TxnNumber, WallClockTime, INCOMPLETE_HISTORY_STMT_ID,
    UNINITIALIZED_TXN_NUMBER,
};
use history::fetch_active_transaction_history;
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// Lifecycle of the session's active transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Retryable writes, or nothing yet.
    None,
    /// Multi-statement transaction accepting operations.
    InProgress,
    /// Snapshot read holding a storage transaction.
    InSnapshotRead,
    /// Commit underway.
    Committing,
    /// Committed.
    Committed,
    /// Aborted.
    Aborted,
}

impl TxnState {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::InProgress => "in-progress",
            Self::InSnapshotRead => "in-snapshot-read",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SessionState {
    is_valid: bool,
    num_invalidations: u64,
    last_written_record: Option<SessionTxnRecord>,
    active_txn_number: TxnNumber,
    committed_statements: HashMap<StmtId, OpTime>,
    has_incomplete_history: bool,
    autocommit: bool,
    txn_state: TxnState,
    stash: Option<TxnResources>,
    transaction_operations: Vec<ReplOperation>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            is_valid: false,
            num_invalidations: 0,
            last_written_record: None,
            active_txn_number: UNINITIALIZED_TXN_NUMBER,
            committed_statements: HashMap::new(),
            has_incomplete_history: false,
            autocommit: true,
            txn_state: TxnState::None,
            stash: None,
            transaction_operations: Vec::new(),
        }
    }

    /// Drops the stash and buffered operations; the stash is returned so the
    /// caller can drop it after unlocking.
    fn release_stashed_resources(&mut self) -> Option<TxnResources> {
        self.transaction_operations.clear();
        self.txn_state = TxnState::None;
        self.stash.take()
    }
}

#[cfg(test)]
type RefreshHook = Box<dyn Fn() + Send + Sync>;

/// Transaction state of one logical session.
pub struct Session {
    session_id: LogicalSessionId,
    engine: Arc<StorageEngine>,
    state: Mutex<SessionState>,
    #[cfg(test)]
    refresh_hook: Mutex<Option<RefreshHook>>,
}

impl Session {
    /// Creates a session whose view still has to be loaded from storage.
    #[must_use]
    pub fn new(session_id: LogicalSessionId, engine: Arc<StorageEngine>) -> Self {
        Self {
            session_id,
            engine,
            state: Mutex::new(SessionState::new()),
            #[cfg(test)]
            refresh_hook: Mutex::new(None),
        }
    }

    /// Identity of this session.
    #[must_use]
    pub const fn session_id(&self) -> &LogicalSessionId {
        &self.session_id
    }

    /// Engine this session writes through.
    #[must_use]
    pub const fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Reloads the view from storage if it has been invalidated.
    ///
    /// Storage is read without holding the session mutex. A result is only
    /// installed if no invalidation happened while reading; otherwise the
    /// read is repeated.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Interrupted`] if the operation is killed, or any
    /// error from reading the table or the oplog, including
    /// [`CoreError::DuplicateStatement`] for a corrupt history.
    pub fn refresh_from_storage_if_needed(&self, opctx: &OperationContext) -> CoreResult<()> {
        ensure_unlocked(opctx)?;

        let mut state = self.state.lock();
        while !state.is_valid {
            let invalidations = state.num_invalidations;
            let history = MutexGuard::unlocked(&mut state, || {
                opctx.check_for_interrupt()?;
                #[cfg(test)]
                self.run_refresh_hook();
                fetch_active_transaction_history(&self.engine, &self.session_id)
            })?;

            if !state.is_valid && state.num_invalidations == invalidations {
                state.is_valid = true;
                state.last_written_record = history.last_txn_record;
                if let Some(record) = history.last_txn_record {
                    state.active_txn_number = record.txn_num;
                    state.committed_statements = history.committed_statements;
                    state.has_incomplete_history = history.has_incomplete_history;
                }
                self.engine.stats().record_session_refresh();
                debug!(
                    session = %self.session_id,
                    txn_number = state.active_txn_number,
                    statements = state.committed_statements.len(),
                    incomplete = state.has_incomplete_history,
                    "refreshed session from storage"
                );
                break;
            }
            debug!(session = %self.session_id, "session invalidated during refresh; retrying");
        }
        Ok(())
    }

    /// Starts `txn_number` or continues it if it is already active.
    ///
    /// `autocommit` may only be given when starting a transaction;
    /// `Some(false)` starts a multi-statement transaction. Starting a new
    /// number discards the previous transaction's statements and stash.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ConcurrentModification`] if the view is invalid.
    /// - [`CoreError::StaleTransaction`] if `txn_number` is older than the
    ///   active one.
    /// - [`CoreError::ConflictingTransaction`] if a multi-statement
    ///   transaction with buffered operations, or one that is committing,
    ///   is still active.
    /// - [`CoreError::IllegalOperation`] if `autocommit` is given when
    ///   continuing.
    pub fn begin_or_continue_txn(
        &self,
        opctx: &OperationContext,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
    ) -> CoreResult<()> {
        ensure_unlocked(opctx)?;
        let superseded = {
            let mut state = self.state.lock();
            self.begin_or_continue_locked(&mut state, txn_number, autocommit)?
        };
        drop(superseded);
        Ok(())
    }

    /// Like [`Session::begin_or_continue_txn`] for statements copied in by a
    /// migration; autocommit is never involved.
    ///
    /// # Errors
    ///
    /// Same validity and ordering errors as
    /// [`Session::begin_or_continue_txn`].
    pub fn begin_or_continue_txn_on_migration(
        &self,
        opctx: &OperationContext,
        txn_number: TxnNumber,
    ) -> CoreResult<()> {
        ensure_unlocked(opctx)?;
        let superseded = {
            let mut state = self.state.lock();
            self.check_valid(&state)?;
            self.check_txn_valid(&state, txn_number)?;
            if txn_number == state.active_txn_number {
                return Ok(());
            }
            self.set_active_txn(&mut state, txn_number)
        };
        drop(superseded);
        Ok(())
    }

    fn begin_or_continue_locked(
        &self,
        state: &mut SessionState,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
    ) -> CoreResult<Option<TxnResources>> {
        self.check_valid(state)?;
        self.check_txn_valid(state, txn_number)?;

        if txn_number == state.active_txn_number {
            if autocommit.is_some() {
                return Err(CoreError::illegal_operation(
                    "specifying 'autocommit' is only allowed at the beginning of a transaction",
                ));
            }
            return Ok(None);
        }

        let superseded = self.set_active_txn(state, txn_number);
        state.autocommit = autocommit.unwrap_or(true);
        state.txn_state = if state.autocommit {
            TxnState::None
        } else {
            self.engine.stats().record_transaction_start();
            TxnState::InProgress
        };
        debug!(
            session = %self.session_id,
            txn_number,
            autocommit = state.autocommit,
            "began transaction"
        );
        Ok(superseded)
    }

    fn set_active_txn(
        &self,
        state: &mut SessionState,
        txn_number: TxnNumber,
    ) -> Option<TxnResources> {
        state.active_txn_number = txn_number;
        state.committed_statements.clear();
        state.has_incomplete_history = false;
        state.autocommit = true;
        state.txn_state = TxnState::None;
        let superseded = state.stash.take();
        if superseded.is_some() {
            debug!(
                session = %self.session_id,
                txn_number,
                "discarding stashed resources of superseded transaction"
            );
        }
        superseded
    }

    /// Records that a retryable write's statements were written in the
    /// caller's open write unit of work.
    ///
    /// Stages the session's table row; the in-memory view is advanced only
    /// when the unit of work commits. Does nothing inside a multi-statement
    /// transaction.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DuplicateStatement`] if any statement already
    ///   committed. This is unrecoverable.
    /// - [`CoreError::IncompleteHistory`] if a statement's status cannot be
    ///   determined.
    /// - [`CoreError::WriteConflict`] if the table row moved underneath.
    /// - [`CoreError::InvalidOperation`] outside a write unit of work.
    pub fn on_write_op_completed_on_primary(
        self: &Arc<Self>,
        opctx: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        last_stmt_write_op_time: OpTime,
        last_stmt_write_date: WallClockTime,
    ) -> CoreResult<()> {
        ensure_in_write_unit_of_work(opctx)?;
        {
            let state = self.state.lock();
            if !state.autocommit {
                return Ok(());
            }
            self.check_valid(&state)?;
            self.check_is_active(&state, txn_number)?;
            for &stmt_id in &stmt_ids {
                if let Some(first) = self.check_statement_executed_locked(&state, txn_number, stmt_id)? {
                    return Err(self.duplicate_statement(
                        txn_number,
                        stmt_id,
                        first,
                        last_stmt_write_op_time,
                    ));
                }
            }
        }

        let request = self.make_update_request(txn_number, last_stmt_write_op_time, last_stmt_write_date);
        self.stage_session_row(opctx, request)?;
        self.register_update_cache_on_commit(
            opctx,
            txn_number,
            stmt_ids,
            last_stmt_write_op_time,
            last_stmt_write_date,
        );
        Ok(())
    }

    /// Decides whether a statement copied from another shard still needs
    /// to be written here.
    ///
    /// Returns `false` if it already executed. Truncated local history does
    /// not stop the copy, except for the dead-end sentinel itself.
    ///
    /// # Errors
    ///
    /// Validity and ordering errors from starting the transaction, and any
    /// error other than incomplete history from the statement lookup.
    pub fn on_migrate_begin_on_primary(
        &self,
        opctx: &OperationContext,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> CoreResult<bool> {
        self.begin_or_continue_txn_on_migration(opctx, txn_number)?;
        match self.check_statement_executed(opctx, txn_number, stmt_id) {
            Ok(Some(_)) => Ok(false),
            Ok(None) => Ok(true),
            Err(CoreError::IncompleteHistory { .. }) => Ok(stmt_id != INCOMPLETE_HISTORY_STMT_ID),
            Err(e) => Err(e),
        }
    }

    /// Records migrated statements written in the caller's open write unit
    /// of work. The statements are not checked for prior execution.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ConcurrentModification`] if the view is invalid.
    /// - [`CoreError::TransactionNotActive`] if another number is active.
    /// - [`CoreError::WriteConflict`] if the table row moved underneath.
    pub fn on_migrate_completed_on_primary(
        self: &Arc<Self>,
        opctx: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        last_stmt_write_op_time: OpTime,
        last_stmt_write_date: WallClockTime,
    ) -> CoreResult<()> {
        ensure_in_write_unit_of_work(opctx)?;
        {
            let state = self.state.lock();
            self.check_valid(&state)?;
            self.check_is_active(&state, txn_number)?;
        }
        let request = self.make_update_request(txn_number, last_stmt_write_op_time, last_stmt_write_date);
        self.stage_session_row(opctx, request)?;
        self.register_update_cache_on_commit(
            opctx,
            txn_number,
            stmt_ids,
            last_stmt_write_op_time,
            last_stmt_write_date,
        );
        Ok(())
    }

    fn make_update_request(
        &self,
        txn_number: TxnNumber,
        op_time: OpTime,
        date: WallClockTime,
    ) -> UpdateRequest {
        UpdateRequest::upsert(SessionTxnRecord {
            session_id: self.session_id,
            txn_num: txn_number,
            last_write_op_time: op_time,
            last_write_date: date,
        })
    }

    fn stage_session_row(&self, opctx: &mut OperationContext, request: UpdateRequest) -> CoreResult<()> {
        let staged = self.engine.session_table().stage_update(request)?;
        opctx.recovery_unit_mut().stage_table_update(staged)
    }

    fn register_update_cache_on_commit(
        self: &Arc<Self>,
        opctx: &mut OperationContext,
        txn_number: TxnNumber,
        stmt_ids: Vec<StmtId>,
        op_time: OpTime,
        date: WallClockTime,
    ) {
        let session: Weak<Self> = Arc::downgrade(self);
        let engine = Arc::clone(&self.engine);
        opctx.recovery_unit_mut().on_commit(move || {
            engine.stats().record_transactions_collection_write();
            let Some(session) = session.upgrade() else {
                return Ok(());
            };
            let (result, superseded) = {
                let mut state = session.state.lock();
                session.apply_committed_write(&mut state, txn_number, &stmt_ids, op_time, date)
            };
            drop(superseded);
            result
        });
    }

    fn apply_committed_write(
        &self,
        state: &mut SessionState,
        txn_number: TxnNumber,
        stmt_ids: &[StmtId],
        op_time: OpTime,
        date: WallClockTime,
    ) -> (CoreResult<()>, Option<TxnResources>) {
        if !state.is_valid {
            return (Ok(()), None);
        }

        let record = state.last_written_record.get_or_insert(SessionTxnRecord {
            session_id: self.session_id,
            txn_num: txn_number,
            last_write_op_time: op_time,
            last_write_date: date,
        });
        if txn_number > record.txn_num {
            record.txn_num = txn_number;
        }
        if op_time > record.last_write_op_time {
            record.last_write_op_time = op_time;
            record.last_write_date = date;
        }

        // The view may have been refreshed before this write's number was
        // ever begun on it.
        let mut superseded = None;
        if txn_number > state.active_txn_number {
            match self.begin_or_continue_locked(state, txn_number, None) {
                Ok(resources) => superseded = resources,
                Err(e) => return (Err(e), None),
            }
        }

        if txn_number == state.active_txn_number {
            for &stmt_id in stmt_ids {
                if stmt_id == INCOMPLETE_HISTORY_STMT_ID {
                    state.has_incomplete_history = true;
                    continue;
                }
                match state.committed_statements.entry(stmt_id) {
                    Entry::Vacant(slot) => {
                        slot.insert(op_time);
                    }
                    Entry::Occupied(existing) if *existing.get() != op_time => {
                        let first = *existing.get();
                        return (
                            Err(self.duplicate_statement(txn_number, stmt_id, first, op_time)),
                            superseded,
                        );
                    }
                    Entry::Occupied(_) => {}
                }
            }
        }
        (Ok(()), superseded)
    }

    /// Marks the view stale and forgets everything cached.
    ///
    /// The stash is left alone; it belongs to whichever operation has the
    /// session checked out.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.is_valid = false;
        state.num_invalidations += 1;
        state.last_written_record = None;
        state.active_txn_number = UNINITIALIZED_TXN_NUMBER;
        state.committed_statements.clear();
        state.has_incomplete_history = false;
        debug!(session = %self.session_id, "invalidated session");
    }

    /// Position of `txn_number`'s latest durable write, or the null optime
    /// if it has none yet.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConcurrentModification`] if the view is invalid, or
    /// [`CoreError::TransactionNotActive`] if another number is active.
    pub fn get_last_write_op_time(&self, txn_number: TxnNumber) -> CoreResult<OpTime> {
        let state = self.state.lock();
        self.check_valid(&state)?;
        self.check_is_active(&state, txn_number)?;
        Ok(match state.last_written_record {
            Some(record) if record.txn_num == txn_number => record.last_write_op_time,
            _ => OpTime::null(),
        })
    }

    /// Returns the oplog entry of `stmt_id` if it already executed.
    ///
    /// # Errors
    ///
    /// - [`CoreError::IncompleteHistory`] if the statement is unknown and
    ///   history was truncated, or its entry is gone from the oplog.
    /// - [`CoreError::ConcurrentModification`] or
    ///   [`CoreError::TransactionNotActive`] as for
    ///   [`Session::get_last_write_op_time`].
    pub fn check_statement_executed(
        &self,
        opctx: &OperationContext,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> CoreResult<Option<OplogEntry>> {
        let op_time = {
            let state = self.state.lock();
            self.check_statement_executed_locked(&state, txn_number, stmt_id)?
        };
        let Some(op_time) = op_time else {
            return Ok(None);
        };

        let mut history = self.engine.oplog().history(op_time);
        while history.has_next() {
            opctx.check_for_interrupt()?;
            let entry = history.next_entry()?;
            if entry.statement_id == Some(stmt_id) {
                self.engine.stats().record_retried_statement();
                return Ok(Some(entry));
            }
        }
        Err(CoreError::oplog_corruption(format!(
            "statement {stmt_id} of transaction {txn_number} on session {} committed at \
             {op_time} but is not in its history",
            self.session_id
        )))
    }

    /// Like [`Session::check_statement_executed`] without reading the oplog.
    ///
    /// # Errors
    ///
    /// Same as [`Session::check_statement_executed`], minus oplog errors.
    pub fn check_statement_executed_no_oplog_entry_fetch(
        &self,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> CoreResult<bool> {
        let state = self.state.lock();
        Ok(self
            .check_statement_executed_locked(&state, txn_number, stmt_id)?
            .is_some())
    }

    fn check_statement_executed_locked(
        &self,
        state: &SessionState,
        txn_number: TxnNumber,
        stmt_id: StmtId,
    ) -> CoreResult<Option<OpTime>> {
        self.check_valid(state)?;
        self.check_is_active(state, txn_number)?;

        match state.committed_statements.get(&stmt_id) {
            Some(op_time) => Ok(Some(*op_time)),
            None if state.has_incomplete_history => Err(CoreError::incomplete_history(format!(
                "incomplete history detected for transaction {txn_number} on session {}",
                self.session_id
            ))),
            None => Ok(None),
        }
    }

    /// Parks the operation's storage resources on the session at the end
    /// of a statement of a multi-statement transaction or snapshot read.
    ///
    /// A snapshot read with no cursor left open is committed instead of
    /// parked. Does nothing outside those states.
    ///
    /// # Errors
    ///
    /// - [`CoreError::TransactionAborted`] if another transaction number
    ///   became active.
    /// - [`CoreError::InvalidOperation`] if something is already stashed.
    pub fn stash_transaction_resources(&self, opctx: &mut OperationContext) -> CoreResult<()> {
        let txn_number = opctx.require_txn_number()?;
        let client = Arc::clone(opctx.client());
        let mut client_info = client.lock();
        let mut state = self.state.lock();

        if txn_number != state.active_txn_number {
            return Err(CoreError::transaction_aborted(format!(
                "active transaction number is now {}",
                state.active_txn_number
            )));
        }
        if !matches!(state.txn_state, TxnState::InProgress | TxnState::InSnapshotRead) {
            return Ok(());
        }

        if state.txn_state == TxnState::InSnapshotRead && !opctx.has_stashed_cursor() {
            ensure_in_write_unit_of_work(opctx)?;
            state.txn_state = TxnState::Committing;
            let result = MutexGuard::unlocked(&mut state, || opctx.commit_write_unit_of_work());
            state.txn_state = if result.is_ok() {
                TxnState::Committed
            } else {
                TxnState::Aborted
            };
            debug!(session = %self.session_id, txn_number, "completed snapshot read");
            return result;
        }

        if state.stash.is_some() {
            return Err(CoreError::invalid_operation(format!(
                "transaction {txn_number} on session {} already has stashed resources",
                self.session_id
            )));
        }
        state.stash = Some(TxnResources::stash(opctx, &mut client_info)?);
        Ok(())
    }

    /// Gives the operation the session's parked resources, or opens a
    /// storage transaction for the first statement of a multi-statement
    /// transaction or snapshot read.
    ///
    /// # Errors
    ///
    /// - [`CoreError::TransactionAborted`] if the operation's number is
    ///   older than the active one; any stash is discarded.
    /// - [`CoreError::InvalidOptions`] if a continuing statement carries a
    ///   read concern.
    /// - [`CoreError::Interrupted`] if killed while waiting for a ticket.
    pub fn unstash_transaction_resources(&self, opctx: &mut OperationContext) -> CoreResult<()> {
        let txn_number = opctx.require_txn_number()?;
        let client = Arc::clone(opctx.client());
        let (result, discarded) = {
            let mut client_info = client.lock();
            let mut state = self.state.lock();
            if txn_number < state.active_txn_number {
                let discarded = state.release_stashed_resources();
                (
                    Err(CoreError::transaction_aborted(format!(
                        "active transaction number is now {}",
                        state.active_txn_number
                    ))),
                    discarded,
                )
            } else if let Some(mut stash) = state.stash.take() {
                match stash.release(opctx, &mut client_info) {
                    Ok(()) => (Ok(()), None),
                    Err(e) => {
                        state.stash = Some(stash);
                        (Err(e), None)
                    }
                }
            } else {
                (self.open_transaction_unit(&mut state, opctx), None)
            }
        };
        drop(discarded);
        result
    }

    fn open_transaction_unit(
        &self,
        state: &mut SessionState,
        opctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let snapshot_read = opctx.read_concern().level() == ReadConcernLevel::Snapshot;
        if !snapshot_read && state.txn_state != TxnState::InProgress {
            return Ok(());
        }
        if state.txn_state != TxnState::InProgress && state.txn_state != TxnState::None {
            return Err(CoreError::invalid_operation(format!(
                "cannot start a snapshot read in transaction {} which is {}",
                state.active_txn_number, state.txn_state
            )));
        }
        opctx.begin_write_unit_of_work()?;
        opctx.recovery_unit_mut().preallocate_snapshot();
        if state.txn_state == TxnState::None {
            state.txn_state = TxnState::InSnapshotRead;
        }
        Ok(())
    }

    /// Aborts `txn_number` if it is an active snapshot read.
    pub fn abort_if_snapshot_read(&self, txn_number: TxnNumber) {
        let discarded = {
            let mut state = self.state.lock();
            if state.active_txn_number != txn_number || !state.autocommit {
                return;
            }
            let discarded = state.release_stashed_resources();
            state.txn_state = TxnState::Aborted;
            discarded
        };
        drop(discarded);
    }

    /// Aborts the active transaction, discarding stashed resources and
    /// buffered operations. Calling it again changes nothing.
    pub fn abort_transaction(&self) {
        let (discarded, txn_number, was_aborted) = {
            let mut state = self.state.lock();
            let was_aborted = state.txn_state == TxnState::Aborted;
            let discarded = state.release_stashed_resources();
            state.txn_state = TxnState::Aborted;
            (discarded, state.active_txn_number, was_aborted)
        };
        drop(discarded);
        if !was_aborted {
            self.engine.stats().record_transaction_abort();
            info!(session = %self.session_id, txn_number, "aborted transaction");
        }
    }

    /// Buffers an operation of the running multi-statement transaction.
    ///
    /// The first operation hooks the transaction's outcome to the caller's
    /// write unit of work: rollback aborts the transaction, commit marks it
    /// committed.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidOperation`] unless a multi-statement transaction
    /// is in progress and a write unit of work is open.
    pub fn add_transaction_operation(
        self: &Arc<Self>,
        opctx: &mut OperationContext,
        operation: ReplOperation,
    ) -> CoreResult<()> {
        ensure_in_write_unit_of_work(opctx)?;
        let mut state = self.state.lock();
        if state.txn_state != TxnState::InProgress
            || state.autocommit
            || state.active_txn_number == UNINITIALIZED_TXN_NUMBER
        {
            return Err(CoreError::invalid_operation(format!(
                "operations can only be added to a multi-statement transaction in progress, \
                 but transaction {} on session {} is {}",
                state.active_txn_number, self.session_id, state.txn_state
            )));
        }

        if state.transaction_operations.is_empty() {
            let txn_number = state.active_txn_number;
            let on_rollback = Arc::downgrade(self);
            opctx.recovery_unit_mut().on_rollback(move || {
                if let Some(session) = on_rollback.upgrade() {
                    let mut state = session.state.lock();
                    if state.active_txn_number == txn_number
                        && state.txn_state != TxnState::Committed
                    {
                        state.transaction_operations.clear();
                        state.txn_state = TxnState::Aborted;
                    }
                }
            });
            let on_commit = Arc::downgrade(self);
            opctx.recovery_unit_mut().on_commit(move || {
                if let Some(session) = on_commit.upgrade() {
                    let mut state = session.state.lock();
                    if state.active_txn_number == txn_number {
                        state.txn_state = TxnState::Committed;
                    }
                }
                Ok(())
            });
        }
        state.transaction_operations.push(operation);
        Ok(())
    }

    /// Ends the running multi-statement transaction and hands back its
    /// buffered operations for the commit entry.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidOperation`] unless a multi-statement transaction
    /// is in progress.
    pub fn end_transaction_and_retrieve_operations(&self) -> CoreResult<Vec<ReplOperation>> {
        let mut state = self.state.lock();
        if state.autocommit || state.txn_state != TxnState::InProgress {
            return Err(CoreError::invalid_operation(format!(
                "no multi-statement transaction in progress on session {}",
                self.session_id
            )));
        }
        state.txn_state = if state.transaction_operations.is_empty() {
            TxnState::Committed
        } else {
            TxnState::Committing
        };
        Ok(mem::take(&mut state.transaction_operations))
    }

    /// Commits the running multi-statement transaction with the operation's
    /// resources, writing one `applyOps` entry for its buffered operations.
    ///
    /// Returns the commit entry's position, or `None` if nothing was
    /// buffered.
    ///
    /// # Errors
    ///
    /// - [`CoreError::TransactionNotActive`] if the operation's number is
    ///   not the active one.
    /// - [`CoreError::InvalidOperation`] if no transaction is in progress or
    ///   its resources are not attached to `opctx`.
    /// - Any storage error from the commit; the transaction is then aborted.
    pub fn commit_transaction(
        self: &Arc<Self>,
        opctx: &mut OperationContext,
    ) -> CoreResult<Option<OpTime>> {
        let txn_number = opctx.require_txn_number()?;
        {
            let state = self.state.lock();
            self.check_is_active(&state, txn_number)?;
        }
        ensure_in_write_unit_of_work(opctx)?;

        let operations = self.end_transaction_and_retrieve_operations()?;
        let commit_op_time = if operations.is_empty() {
            None
        } else {
            let op_time = self.engine.oplog().reserve_op_time();
            let entry = OplogEntry::apply_ops(op_time, &operations)
                .with_session(self.session_id, txn_number)
                .with_wall_clock_time(WallClockTime::now());
            opctx.recovery_unit_mut().stage_oplog_entry(entry)?;
            Some(op_time)
        };

        opctx.commit_write_unit_of_work()?;
        self.engine.stats().record_transaction_commit();
        info!(
            session = %self.session_id,
            txn_number,
            operations = operations.len(),
            "committed transaction"
        );
        Ok(commit_op_time)
    }

    /// Active transaction number.
    #[must_use]
    pub fn active_txn_number(&self) -> TxnNumber {
        self.state.lock().active_txn_number
    }

    /// State of the active transaction.
    #[must_use]
    pub fn txn_state(&self) -> TxnState {
        self.state.lock().txn_state
    }

    /// Autocommit mode of the active transaction.
    #[must_use]
    pub fn autocommit(&self) -> bool {
        self.state.lock().autocommit
    }

    /// True if a multi-statement transaction is accepting operations.
    #[must_use]
    pub fn in_multi_document_transaction(&self) -> bool {
        let state = self.state.lock();
        !state.autocommit && state.txn_state == TxnState::InProgress
    }

    /// True if the view reflects storage.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state.lock().is_valid
    }

    /// True if the active transaction's history is known to be truncated.
    #[must_use]
    pub fn has_incomplete_history(&self) -> bool {
        self.state.lock().has_incomplete_history
    }

    /// True if resources are parked on the session.
    #[must_use]
    pub fn has_stashed_resources(&self) -> bool {
        self.state.lock().stash.is_some()
    }

    /// Number of buffered multi-statement operations.
    #[must_use]
    pub fn transaction_operation_count(&self) -> usize {
        self.state.lock().transaction_operations.len()
    }

    /// Cached copy of the session's table row.
    #[must_use]
    pub fn last_written_record(&self) -> Option<SessionTxnRecord> {
        self.state.lock().last_written_record
    }

    /// Number of committed statements known for the active transaction.
    #[must_use]
    pub fn committed_statement_count(&self) -> usize {
        self.state.lock().committed_statements.len()
    }

    fn check_valid(&self, state: &SessionState) -> CoreResult<()> {
        if state.is_valid {
            Ok(())
        } else {
            Err(CoreError::ConcurrentModification {
                session: self.session_id,
            })
        }
    }

    fn check_txn_valid(&self, state: &SessionState, txn_number: TxnNumber) -> CoreResult<()> {
        if txn_number < state.active_txn_number {
            return Err(CoreError::StaleTransaction {
                session: self.session_id,
                requested: txn_number,
                active: state.active_txn_number,
            });
        }
        if txn_number != state.active_txn_number
            && (!state.transaction_operations.is_empty()
                || state.txn_state == TxnState::Committing)
        {
            return Err(CoreError::ConflictingTransaction {
                session: self.session_id,
                requested: txn_number,
                active: state.active_txn_number,
            });
        }
        Ok(())
    }

    fn check_is_active(&self, state: &SessionState, txn_number: TxnNumber) -> CoreResult<()> {
        if txn_number == state.active_txn_number {
            Ok(())
        } else {
            Err(CoreError::TransactionNotActive {
                session: self.session_id,
                requested: txn_number,
                active: state.active_txn_number,
            })
        }
    }

    fn duplicate_statement(
        &self,
        txn_number: TxnNumber,
        stmt_id: StmtId,
        first: OpTime,
        second: OpTime,
    ) -> CoreError {
        error!(
            session = %self.session_id,
            txn_number,
            stmt_id,
            %first,
            %second,
            "statement executed multiple times"
        );
        CoreError::DuplicateStatement {
            session: self.session_id,
            txn_number,
            stmt_id,
            first,
            second,
        }
    }

    #[cfg(test)]
    fn set_refresh_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.refresh_hook.lock() = Some(Box::new(hook));
    }

    #[cfg(test)]
    fn run_refresh_hook(&self) {
        if let Some(hook) = self.refresh_hook.lock().as_ref() {
            hook();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("is_valid", &state.is_valid)
            .field("active_txn_number", &state.active_txn_number)
            .field("txn_state", &state.txn_state)
            .field("autocommit", &state.autocommit)
            .finish_non_exhaustive()
    }
}

fn ensure_unlocked(opctx: &OperationContext) -> CoreResult<()> {
    if opctx.locker().is_locked() {
        Err(CoreError::invalid_operation(
            "session state must not be loaded while holding locks",
        ))
    } else {
        Ok(())
    }
}

fn ensure_in_write_unit_of_work(opctx: &OperationContext) -> CoreResult<()> {
    if opctx.in_write_unit_of_work() {
        Ok(())
    } else {
        Err(CoreError::invalid_operation(
            "operation must run inside a write unit of work",
        ))
    }
}
