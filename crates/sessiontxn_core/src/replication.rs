//! Keeping the session transaction table in step with replicated writes.
//!
//! Every oplog entry written on behalf of a session implies an upsert of
//! that session's table row. Primaries write the row directly; nodes
//! replaying the oplog derive it from the entry with
//! [`create_matching_transaction_table_update`]. A node whose oplog
//! diverged rolls it back with [`SecondaryApplier::roll_back_to`].

use crate::engine::StorageEngine;
use crate::error::{CoreError, CoreResult};
use crate::oplog::{OpType, OplogEntry};
use crate::session::SessionCatalog;
use crate::session_table::{SessionTxnRecord, SESSION_TRANSACTIONS_NS};
use crate::types::OpTime;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Derives the table upsert implied by `entry`.
///
/// Returns `None` for entries without a transaction number and for
/// `applyOps` commands, whose session bookkeeping is not replicated this
/// way. The derived entry shares the source entry's optime and wall-clock
/// time and replaces the whole row, so applying it twice is harmless.
///
/// # Errors
///
/// Returns an oplog corruption error if the entry carries a transaction
/// number but no session id or no wall-clock time.
pub fn create_matching_transaction_table_update(
    entry: &OplogEntry,
) -> CoreResult<Option<OplogEntry>> {
    let Some(txn_number) = entry.session_info.txn_number else {
        return Ok(None);
    };
    if entry.is_apply_ops() {
        return Ok(None);
    }

    let Some(session_id) = entry.session_info.session_id else {
        return Err(CoreError::oplog_corruption(format!(
            "entry at {} has a transaction number but no session id",
            entry.op_time
        )));
    };
    let Some(wall_clock_time) = entry.wall_clock_time else {
        return Err(CoreError::oplog_corruption(format!(
            "entry at {} of session {session_id} has no wall-clock time",
            entry.op_time
        )));
    };

    let record = SessionTxnRecord {
        session_id,
        txn_num: txn_number,
        last_write_op_time: entry.op_time,
        last_write_date: wall_clock_time,
    };
    Ok(Some(
        OplogEntry::new(
            entry.op_time,
            OpType::Update,
            SESSION_TRANSACTIONS_NS,
            record.to_document(),
        )
        .with_object2(record.id_query())
        .with_upsert(true)
        .with_wall_clock_time(wall_clock_time),
    ))
}

/// Interleaves each entry with the table upsert it implies, placed right
/// after it.
///
/// # Errors
///
/// Propagates [`create_matching_transaction_table_update`] errors.
pub fn add_ops_for_replicating_txn_table(ops: &[OplogEntry]) -> CoreResult<Vec<OplogEntry>> {
    let mut new_ops = Vec::with_capacity(ops.len() * 2);
    for op in ops {
        new_ops.push(op.clone());
        if let Some(update) = create_matching_transaction_table_update(op)? {
            new_ops.push(update);
        }
    }
    Ok(new_ops)
}

/// Outcome of [`SecondaryApplier::apply_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Oplog entries not already present.
    pub entries_written: usize,
    /// Table rows that changed.
    pub rows_changed: usize,
    /// Sessions whose cached view was invalidated.
    pub sessions_invalidated: usize,
}

/// Outcome of [`SecondaryApplier::roll_back_to`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolledBack {
    /// Oplog entries removed.
    pub entries_removed: usize,
    /// Sessions whose removed writes were forgotten.
    pub sessions_rolled_back: usize,
    /// Sessions whose cached view was invalidated.
    pub sessions_invalidated: usize,
}

/// Applies batches of oplog entries received from another node.
pub struct SecondaryApplier {
    engine: Arc<StorageEngine>,
    catalog: Arc<SessionCatalog>,
}

impl SecondaryApplier {
    /// Creates an applier writing to `engine` and invalidating sessions in
    /// `catalog`.
    #[must_use]
    pub fn new(engine: Arc<StorageEngine>, catalog: Arc<SessionCatalog>) -> Self {
        Self { engine, catalog }
    }

    /// Appends the batch to the oplog and applies the table upserts it
    /// implies, then invalidates every session the batch touched.
    ///
    /// Only the last upsert per session is applied; earlier ones in the
    /// same batch are superseded by it.
    ///
    /// Replaying a batch that was already applied changes nothing.
    ///
    /// # Errors
    ///
    /// Returns storage and codec errors, or corruption errors for entries
    /// with incomplete session metadata. Nothing is invalidated on error.
    pub fn apply_batch(&self, batch: &[OplogEntry]) -> CoreResult<AppliedBatch> {
        let mut entries = Vec::with_capacity(batch.len());
        let mut latest = BTreeMap::new();
        for op in add_ops_for_replicating_txn_table(batch)? {
            if op.op_type == OpType::Update && op.ns == SESSION_TRANSACTIONS_NS {
                let row = SessionTxnRecord::from_document(&op.object)?;
                latest.insert(row.session_id, row);
            } else {
                entries.push(op);
            }
        }
        let rows: Vec<SessionTxnRecord> = latest.into_values().collect();

        let (entries_written, rows_changed) = self.engine.apply_replicated(&entries, &rows)?;

        let mut sessions_invalidated = 0;
        for session_id in rows.iter().map(|row| &row.session_id) {
            if self.catalog.invalidate_session(session_id) {
                sessions_invalidated += 1;
            }
        }
        debug!(
            entries = entries_written,
            rows = rows_changed,
            sessions = sessions_invalidated,
            "applied replicated batch"
        );
        Ok(AppliedBatch {
            entries_written,
            rows_changed,
            sessions_invalidated,
        })
    }
}

impl SecondaryApplier {
    /// Removes every oplog entry after `common_point`, reverts the table
    /// rows of the sessions that wrote them and invalidates those sessions,
    /// so their next refresh no longer reports the removed statements as
    /// executed.
    ///
    /// # Errors
    ///
    /// Returns storage and codec errors. Nothing is invalidated on error.
    pub fn roll_back_to(&self, common_point: OpTime) -> CoreResult<RolledBack> {
        let removed = self.engine.roll_back_after(common_point)?;
        let session_ids: BTreeSet<_> = removed
            .iter()
            .filter_map(|entry| entry.session_info.session_id)
            .collect();

        let mut sessions_invalidated = 0;
        for session_id in &session_ids {
            if self.catalog.invalidate_session(session_id) {
                sessions_invalidated += 1;
            }
        }
        info!(
            common_point = %common_point,
            entries = removed.len(),
            sessions = session_ids.len(),
            "rolled back replicated writes"
        );
        Ok(RolledBack {
            entries_removed: removed.len(),
            sessions_rolled_back: session_ids.len(),
            sessions_invalidated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::ReplOperation;
    use crate::types::{LogicalSessionId, OpTime, WallClockTime};
    use sessiontxn_codec::Document;

    fn session_write(lsid: LogicalSessionId, ts: u64, stmt: i32) -> OplogEntry {
        OplogEntry::new(OpTime::new(ts, 1), OpType::Insert, "test.items", Document::new())
            .with_session(lsid, 7)
            .with_statement_id(stmt)
            .with_prev_write_op_time(OpTime::null())
            .with_wall_clock_time(WallClockTime::from_millis(500))
    }

    #[test]
    fn derives_upsert_for_session_write() {
        let lsid = LogicalSessionId::new("erin");
        let entry = session_write(lsid, 12, 0);
        let update = create_matching_transaction_table_update(&entry)
            .unwrap()
            .unwrap();

        assert_eq!(update.op_time, entry.op_time);
        assert_eq!(update.op_type, OpType::Update);
        assert_eq!(update.ns, SESSION_TRANSACTIONS_NS);
        assert_eq!(update.upsert, Some(true));
        assert_eq!(update.session_info.txn_number, None);
        assert_eq!(update.statement_id, None);

        let row = SessionTxnRecord::from_document(&update.object).unwrap();
        assert_eq!(row.session_id, lsid);
        assert_eq!(row.txn_num, 7);
        assert_eq!(row.last_write_op_time, OpTime::new(12, 1));
        assert_eq!(update.object2, Some(row.id_query()));
    }

    #[test]
    fn skips_plain_and_apply_ops_entries() {
        let plain = OplogEntry::new(OpTime::new(1, 1), OpType::Insert, "test.items", Document::new());
        assert!(create_matching_transaction_table_update(&plain).unwrap().is_none());

        let commit = OplogEntry::apply_ops(
            OpTime::new(2, 1),
            &[ReplOperation::new(OpType::Insert, "test.items", Document::new())],
        )
        .with_session(LogicalSessionId::new("f"), 3)
        .with_wall_clock_time(WallClockTime::from_millis(1));
        assert!(create_matching_transaction_table_update(&commit).unwrap().is_none());
    }

    #[test]
    fn missing_wall_clock_time_is_corruption() {
        let mut entry = session_write(LogicalSessionId::new("g"), 3, 0);
        entry.wall_clock_time = None;
        assert!(create_matching_transaction_table_update(&entry).is_err());
    }

    #[test]
    fn upserts_follow_their_source() {
        let lsid = LogicalSessionId::new("h");
        let ops = vec![
            session_write(lsid, 1, 0),
            OplogEntry::new(OpTime::new(2, 1), OpType::Noop, "", Document::new()),
            session_write(lsid, 3, 1),
        ];
        let expanded = add_ops_for_replicating_txn_table(&ops).unwrap();
        let namespaces: Vec<&str> = expanded.iter().map(|op| op.ns.as_str()).collect();
        assert_eq!(
            namespaces,
            ["test.items", SESSION_TRANSACTIONS_NS, "", "test.items", SESSION_TRANSACTIONS_NS]
        );
    }

    #[test]
    fn replayed_batch_changes_nothing() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let catalog = Arc::new(SessionCatalog::new(Arc::clone(&engine)));
        let applier = SecondaryApplier::new(Arc::clone(&engine), Arc::clone(&catalog));
        let lsid = LogicalSessionId::new("i");
        let session = catalog.get_or_create(lsid);
        let batch = vec![session_write(lsid, 5, 0), session_write(lsid, 6, 1)];

        let first = applier.apply_batch(&batch).unwrap();
        assert_eq!(first.entries_written, 2);
        assert_eq!(first.rows_changed, 1);
        assert_eq!(first.sessions_invalidated, 1);
        assert!(!session.is_valid());
        let row = engine.session_table().find(&lsid).unwrap();

        let second = applier.apply_batch(&batch).unwrap();
        assert_eq!(second.entries_written, 0);
        assert_eq!(second.rows_changed, 0);
        assert_eq!(engine.session_table().find(&lsid), Some(row));
        assert_eq!(row.last_write_op_time, OpTime::new(6, 1));
    }

    #[test]
    fn older_batch_does_not_move_row_back() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let catalog = Arc::new(SessionCatalog::new(Arc::clone(&engine)));
        let applier = SecondaryApplier::new(Arc::clone(&engine), catalog);
        let lsid = LogicalSessionId::new("j");
        let older = vec![session_write(lsid, 5, 0)];
        let newer = vec![session_write(lsid, 6, 1)];

        applier.apply_batch(&older).unwrap();
        applier.apply_batch(&newer).unwrap();
        let replayed = applier.apply_batch(&older).unwrap();

        assert_eq!(replayed.rows_changed, 0);
        let row = engine.session_table().find(&lsid).unwrap();
        assert_eq!(row.last_write_op_time, OpTime::new(6, 1));
    }

    #[test]
    fn roll_back_invalidates_sessions_of_removed_entries() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let catalog = Arc::new(SessionCatalog::new(Arc::clone(&engine)));
        let applier = SecondaryApplier::new(Arc::clone(&engine), Arc::clone(&catalog));
        let kept = LogicalSessionId::new("k");
        let lost = LogicalSessionId::new("l");
        applier
            .apply_batch(&[session_write(kept, 5, 0), session_write(lost, 6, 0)])
            .unwrap();
        let session = catalog.get_or_create(lost);

        let outcome = applier.roll_back_to(OpTime::new(5, 1)).unwrap();
        assert_eq!(outcome.entries_removed, 1);
        assert_eq!(outcome.sessions_rolled_back, 1);
        assert_eq!(outcome.sessions_invalidated, 1);
        assert!(!session.is_valid());
        assert_eq!(engine.session_table().find(&lost), None);
        assert!(engine.session_table().find(&kept).is_some());
    }
}
