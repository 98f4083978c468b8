//! Rebuilding a session's in-memory view from durable state.

use crate::engine::StorageEngine;
use crate::error::{CoreError, CoreResult};
use crate::session_table::SessionTxnRecord;
use crate::types::{LogicalSessionId, OpTime, StmtId, INCOMPLETE_HISTORY_STMT_ID};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{error, warn};

/// What storage says about a session's newest transaction.
#[derive(Debug, Default)]
pub(crate) struct ActiveTransactionHistory {
    pub last_txn_record: Option<SessionTxnRecord>,
    pub committed_statements: HashMap<StmtId, OpTime>,
    pub has_incomplete_history: bool,
}

/// Reads the session's row and walks its newest transaction's statement
/// chain.
///
/// A dead-end sentinel or a truncated link marks the history incomplete;
/// the statements found before that point are kept.
pub(crate) fn fetch_active_transaction_history(
    engine: &StorageEngine,
    session_id: &LogicalSessionId,
) -> CoreResult<ActiveTransactionHistory> {
    let mut result = ActiveTransactionHistory::default();
    let Some(record) = engine.session_table().find(session_id) else {
        return Ok(result);
    };
    result.last_txn_record = Some(record);

    let mut history = engine.oplog().history(record.last_write_op_time);
    while history.has_next() {
        let entry = match history.next_entry() {
            Ok(entry) => entry,
            Err(CoreError::IncompleteHistory { .. }) => {
                warn!(
                    session = %session_id,
                    txn_number = record.txn_num,
                    "statement history of session is incomplete"
                );
                result.has_incomplete_history = true;
                break;
            }
            Err(e) => return Err(e),
        };

        let Some(stmt_id) = entry.statement_id else {
            return Err(CoreError::oplog_corruption(format!(
                "entry at {} in the history of session {session_id} has no statement id",
                entry.op_time
            )));
        };
        if stmt_id == INCOMPLETE_HISTORY_STMT_ID {
            if !entry.is_dead_end_sentinel() {
                return Err(CoreError::oplog_corruption(format!(
                    "entry at {} uses the reserved statement id without the dead-end sentinel",
                    entry.op_time
                )));
            }
            result.has_incomplete_history = true;
            continue;
        }

        match result.committed_statements.entry(stmt_id) {
            Entry::Vacant(slot) => {
                slot.insert(entry.op_time);
            }
            Entry::Occupied(existing) => {
                error!(
                    session = %session_id,
                    txn_number = record.txn_num,
                    stmt_id,
                    first = %existing.get(),
                    second = %entry.op_time,
                    "statement executed multiple times"
                );
                return Err(CoreError::DuplicateStatement {
                    session: *session_id,
                    txn_number: record.txn_num,
                    stmt_id,
                    first: *existing.get(),
                    second: entry.op_time,
                });
            }
        }
    }
    Ok(result)
}
