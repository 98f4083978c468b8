//! Helpers shared by the integration tests.

#![allow(dead_code)]

use sessiontxn_codec::Document;
use sessiontxn_core::{
    Client, CoreResult, OpTime, OpType, OperationContext, OplogEntry, Session, StmtId,
    StorageEngine, TxnNumber, WallClockTime, WriteUnitOfWork,
};
use sessiontxn_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const NS: &str = "test.items";

/// A fresh operation on its own client, bound to `session` and `txn_number`.
pub fn operation(session: &Session, txn_number: TxnNumber) -> OperationContext {
    OperationContext::new(Client::new("test-conn"), session.engine())
        .with_session(*session.session_id(), txn_number)
}

/// Refreshes `session` and begins `txn_number` as retryable writes.
pub fn begin_retryable(session: &Session, op: &OperationContext, txn_number: TxnNumber) {
    session.refresh_from_storage_if_needed(op).unwrap();
    session.begin_or_continue_txn(op, txn_number, None).unwrap();
}

/// Writes one insert per statement in a single unit of work, chained to
/// the transaction's previous write, and records them on the session.
///
/// Returns the position of the last statement.
pub fn write_statements(
    session: &Arc<Session>,
    op: &mut OperationContext,
    txn_number: TxnNumber,
    stmt_ids: &[StmtId],
) -> CoreResult<OpTime> {
    let engine = Arc::clone(session.engine());
    let mut wuow = WriteUnitOfWork::new(op)?;
    let mut prev = session.get_last_write_op_time(txn_number)?;
    let wall = WallClockTime::now();
    for &stmt_id in stmt_ids {
        let op_time = engine.oplog().reserve_op_time();
        let entry = insert_entry(op_time, stmt_id)
            .with_session(*session.session_id(), txn_number)
            .with_statement_id(stmt_id)
            .with_prev_write_op_time(prev)
            .with_wall_clock_time(wall);
        wuow.recovery_unit_mut().stage_oplog_entry(entry)?;
        prev = op_time;
    }
    session.on_write_op_completed_on_primary(&mut wuow, txn_number, stmt_ids.to_vec(), prev, wall)?;
    wuow.commit()?;
    Ok(prev)
}

/// Bare insert of `{ _id: stmt_id }`.
pub fn insert_entry(op_time: OpTime, stmt_id: StmtId) -> OplogEntry {
    OplogEntry::new(
        op_time,
        OpType::Insert,
        NS,
        Document::new().with("_id", i64::from(stmt_id)),
    )
}

/// Engine plus a session on it.
pub fn in_memory_session(user: &str) -> (Arc<StorageEngine>, Arc<Session>) {
    let engine = StorageEngine::open_in_memory().unwrap();
    let catalog = sessiontxn_core::SessionCatalog::new(Arc::clone(&engine));
    let session = catalog.get_or_create(sessiontxn_core::LogicalSessionId::new(user));
    (engine, session)
}

/// In-memory backend whose appends fail with "disk full" once its append
/// budget is spent. Clones share both the bytes and the budget.
#[derive(Clone)]
pub struct FailingBackend {
    inner: InMemoryBackend,
    appends_left: Arc<AtomicUsize>,
}

impl FailingBackend {
    /// Wraps `inner` with an unlimited budget.
    pub fn new(inner: InMemoryBackend) -> Self {
        Self {
            inner,
            appends_left: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    /// Lets `appends` more appends through, then fails every one after.
    pub fn fail_after(&self, appends: usize) {
        self.appends_left.store(appends, Ordering::SeqCst);
    }

    /// Lifts the budget.
    pub fn heal(&self) {
        self.appends_left.store(usize::MAX, Ordering::SeqCst);
    }
}

impl StorageBackend for FailingBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let left = self.appends_left.load(Ordering::SeqCst);
        if left == 0 {
            return Err(StorageError::Io(io::Error::other("disk full")));
        }
        if left != usize::MAX {
            self.appends_left.store(left - 1, Ordering::SeqCst);
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}
