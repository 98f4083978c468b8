use super::{SessionTxnRecord, UpdateRequest};
use crate::error::{CoreError, CoreResult};
use crate::oplog::GroupId;
use crate::record::RecordLog;
use crate::types::LogicalSessionId;
use parking_lot::RwLock;
use sessiontxn_codec::{decode_document, encode_document, Document};
use sessiontxn_storage::StorageBackend;
use std::collections::HashMap;
use tracing::{debug, info, warn};

const TABLE_MAGIC: [u8; 4] = *b"STXN";

const KIND_UPSERT: u8 = 1;
const KIND_REMOVE: u8 = 2;

/// An update staged in a recovery unit, with what staging observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagedTableUpdate {
    pub request: UpdateRequest,
    /// Whether a row existed when the update was staged.
    pub existed: bool,
}

/// One row-level change written as part of an oplog group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowChange {
    Upsert(SessionTxnRecord),
    Remove(LogicalSessionId),
}

impl RowChange {
    fn encode(&self, group: GroupId) -> CoreResult<(u8, Vec<u8>)> {
        let g = Document::new().with("g", group as i64);
        let (kind, doc) = match self {
            Self::Upsert(row) => (KIND_UPSERT, g.with("row", row.to_document())),
            Self::Remove(lsid) => (KIND_REMOVE, g.with("_id", lsid.to_document())),
        };
        Ok((kind, encode_document(&doc)?))
    }
}

/// The session transaction table: one [`SessionTxnRecord`] per session.
///
/// Stored as a log of full-row upserts and removals, each tagged with the
/// oplog group it was written under. Only rows of committed groups are
/// replayed; the latest change for a session wins.
pub struct SessionTransactionTable {
    log: RecordLog,
    records: RwLock<HashMap<LogicalSessionId, SessionTxnRecord>>,
}

impl SessionTransactionTable {
    pub(crate) fn open(
        backend: Box<dyn StorageBackend>,
        sync_on_append: bool,
        committed: impl Fn(GroupId) -> bool,
    ) -> CoreResult<Self> {
        let log = RecordLog::new("transaction table", TABLE_MAGIC, backend, sync_on_append);
        let mut records = HashMap::new();
        let mut skipped = 0usize;
        for framed in log.recover()? {
            let doc = decode_document(&framed.payload)?;
            let raw = doc.require_i64("g")?;
            let group = GroupId::try_from(raw).map_err(|_| {
                CoreError::table_corruption(format!(
                    "negative group id {raw} at offset {}",
                    framed.offset
                ))
            })?;
            if !committed(group) {
                skipped += 1;
                continue;
            }
            match framed.kind {
                KIND_UPSERT => {
                    let record = SessionTxnRecord::from_document(doc.require_document("row")?)?;
                    records.insert(record.session_id, record);
                }
                KIND_REMOVE => {
                    let lsid = LogicalSessionId::from_document(doc.require_document("_id")?)?;
                    records.remove(&lsid);
                }
                other => {
                    return Err(CoreError::table_corruption(format!(
                        "unknown record kind {other} at offset {}",
                        framed.offset
                    )))
                }
            }
        }
        if skipped > 0 {
            warn!(rows = skipped, "discarding rows of uncommitted groups");
        }
        info!(sessions = records.len(), "opened session transaction table");
        Ok(Self {
            log,
            records: RwLock::new(records),
        })
    }

    /// Looks up a session's row by primary key.
    #[must_use]
    pub fn find(&self, session_id: &LogicalSessionId) -> Option<SessionTxnRecord> {
        self.records.read().get(session_id).copied()
    }

    /// Every row, ordered by session id.
    #[must_use]
    pub fn records(&self) -> Vec<SessionTxnRecord> {
        let mut all: Vec<SessionTxnRecord> = self.records.read().values().copied().collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks `request` against the current row and captures what it saw.
    pub(crate) fn stage_update(&self, request: UpdateRequest) -> CoreResult<StagedTableUpdate> {
        let existed = match self.find(request.session_id()) {
            None if request.upsert => false,
            None => {
                return Err(CoreError::write_conflict(format!(
                    "no transaction record for session {}",
                    request.session_id()
                )))
            }
            Some(current) if !request.matches(&current) => {
                return Err(stale_row(&request, &current));
            }
            Some(_) => true,
        };
        Ok(StagedTableUpdate { request, existed })
    }

    /// Re-checks staged updates against the current rows without writing.
    pub(crate) fn validate(&self, updates: &[StagedTableUpdate]) -> CoreResult<()> {
        validate_against(&self.records.read(), updates)
    }

    /// Rows of replicated `incoming` that move a session forward.
    ///
    /// A row identical to, or older than, the stored one is dropped, so
    /// replaying an earlier batch never moves a session backwards.
    pub(crate) fn replicated_changes(&self, incoming: &[SessionTxnRecord]) -> Vec<RowChange> {
        let records = self.records.read();
        let mut latest: HashMap<LogicalSessionId, SessionTxnRecord> = HashMap::new();
        let mut changes = Vec::new();
        for row in incoming {
            let current = latest
                .get(&row.session_id)
                .or_else(|| records.get(&row.session_id))
                .copied();
            let advances = current.map_or(true, |current| {
                current != *row && UpdateRequest::upsert(*row).matches(&current)
            });
            if !advances {
                debug!(lsid = %row.session_id, "skipping replicated row that does not advance");
                continue;
            }
            latest.insert(row.session_id, *row);
            changes.push(RowChange::Upsert(*row));
        }
        changes
    }

    /// Durably writes `changes` tagged with `group`. Nothing is visible
    /// until [`SessionTransactionTable::install`].
    pub(crate) fn append_group_rows(&self, group: GroupId, changes: &[RowChange]) -> CoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut payloads = Vec::with_capacity(changes.len());
        for change in changes {
            payloads.push(change.encode(group)?);
        }
        self.log.append_batch(&payloads)?;
        Ok(())
    }

    /// Makes written changes visible, in order.
    pub(crate) fn install(&self, changes: &[RowChange]) {
        if changes.is_empty() {
            return;
        }
        let mut records = self.records.write();
        for change in changes {
            match change {
                RowChange::Upsert(row) => {
                    records.insert(row.session_id, *row);
                }
                RowChange::Remove(lsid) => {
                    records.remove(lsid);
                }
            }
        }
        debug!(rows = changes.len(), "installed session transaction rows");
    }
}

fn validate_against(
    records: &HashMap<LogicalSessionId, SessionTxnRecord>,
    updates: &[StagedTableUpdate],
) -> CoreResult<()> {
    let mut written: HashMap<LogicalSessionId, SessionTxnRecord> = HashMap::new();
    for update in updates {
        let session_id = *update.request.session_id();
        let earlier_in_batch = written.get(&session_id).copied();
        let current = earlier_in_batch.or_else(|| records.get(&session_id).copied());
        match current {
            None if update.existed => {
                return Err(CoreError::write_conflict(format!(
                    "transaction record for session {session_id} disappeared"
                )))
            }
            None => {}
            Some(_) if !update.existed && earlier_in_batch.is_none() => {
                return Err(CoreError::write_conflict(format!(
                    "transaction record for session {session_id} was inserted concurrently"
                )))
            }
            Some(current) if !update.request.matches(&current) => {
                return Err(stale_row(&update.request, &current));
            }
            Some(_) => {}
        }
        written.insert(session_id, update.request.replacement);
    }
    Ok(())
}

fn stale_row(request: &UpdateRequest, current: &SessionTxnRecord) -> CoreError {
    CoreError::write_conflict(format!(
        "transaction record for session {} is at transaction {} {}, newer than {} {}",
        current.session_id,
        current.txn_num,
        current.last_write_op_time,
        request.replacement.txn_num,
        request.replacement.last_write_op_time
    ))
}
