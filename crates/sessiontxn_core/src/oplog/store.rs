//! Durable, position-indexed oplog.

use super::{OplogEntry, TransactionHistoryIterator};
use crate::error::{CoreError, CoreResult};
use crate::record::RecordLog;
use crate::types::OpTime;
use parking_lot::RwLock;
use sessiontxn_codec::{decode_document, encode_document, Document};
use sessiontxn_storage::StorageBackend;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use tracing::{debug, info, warn};

const OPLOG_MAGIC: [u8; 4] = *b"SOPL";

const KIND_ENTRY: u8 = 1;
const KIND_TRUNCATE: u8 = 2;
const KIND_BEGIN: u8 = 3;
const KIND_COMMIT: u8 = 4;
const KIND_ROLLBACK: u8 = 5;

/// Identifies one unit of work's records across the oplog and the
/// transaction table.
pub(crate) type GroupId = u64;

/// Term used when nothing has been logged yet.
const INITIAL_TERM: i64 = 1;

struct OplogState {
    /// Live entries by position.
    index: BTreeMap<OpTime, u64>,
    next_timestamp: u64,
    term: i64,
    last_applied: OpTime,
    truncated_before: Option<OpTime>,
    next_group: GroupId,
    /// Groups that were begun but never committed.
    abandoned_groups: HashSet<GroupId>,
}

/// A group whose BEGIN record is written but whose COMMIT is not.
#[derive(Debug)]
pub(crate) struct OpenGroup {
    id: GroupId,
    entries: Vec<(OpTime, u64)>,
    roll_back_after: Option<OpTime>,
}

impl OpenGroup {
    fn new(id: GroupId) -> Self {
        Self {
            id,
            entries: Vec::new(),
            roll_back_after: None,
        }
    }

    pub(crate) const fn id(&self) -> GroupId {
        self.id
    }
}

/// Append-only log of [`OplogEntry`] values, looked up by [`OpTime`].
///
/// Positions are handed out by [`Oplog::reserve_op_time`] while a write is
/// staged and become visible once the owning unit of work commits. Entries
/// below the retention point set by [`Oplog::truncate_before`] are gone for
/// good, which is what makes statement history incomplete.
///
/// A unit of work is written as a group: a BEGIN record, its entries, then
/// a COMMIT record. Recovery only keeps groups whose COMMIT made it to disk.
pub struct Oplog {
    log: RecordLog,
    state: RwLock<OplogState>,
}

impl Oplog {
    /// Opens the oplog over `backend`, replaying what is already there.
    pub(crate) fn open(backend: Box<dyn StorageBackend>, sync_on_append: bool) -> CoreResult<Self> {
        let log = RecordLog::new("oplog", OPLOG_MAGIC, backend, sync_on_append);
        let mut state = OplogState {
            index: BTreeMap::new(),
            next_timestamp: 1,
            term: INITIAL_TERM,
            last_applied: OpTime::null(),
            truncated_before: None,
            next_group: 1,
            abandoned_groups: HashSet::new(),
        };

        let mut open: Option<OpenGroup> = None;
        for record in log.recover()? {
            let doc = decode_document(&record.payload)?;
            match record.kind {
                KIND_BEGIN => {
                    let id = group_id(&doc)?;
                    state.next_group = state.next_group.max(id + 1);
                    if let Some(unfinished) = open.replace(OpenGroup::new(id)) {
                        state.abandoned_groups.insert(unfinished.id);
                    }
                }
                KIND_ENTRY => {
                    let entry = OplogEntry::from_document(&doc)?;
                    open.as_mut()
                        .ok_or_else(|| outside_group("entry", record.offset))?
                        .entries
                        .push((entry.op_time, record.offset));
                }
                KIND_ROLLBACK => {
                    let after = OpTime::from_document(&doc)?;
                    open.as_mut()
                        .ok_or_else(|| outside_group("rollback", record.offset))?
                        .roll_back_after = Some(after);
                }
                KIND_COMMIT => {
                    let id = group_id(&doc)?;
                    match open.take() {
                        Some(group) if group.id == id => {
                            state.apply(&group);
                        }
                        _ => {
                            return Err(CoreError::oplog_corruption(format!(
                                "commit of group {id} at offset {} has no matching begin",
                                record.offset
                            )))
                        }
                    }
                }
                KIND_TRUNCATE => {
                    let before = OpTime::from_document(&doc)?;
                    state.truncate(before);
                }
                other => {
                    return Err(CoreError::oplog_corruption(format!(
                        "unknown record kind {other} at offset {}",
                        record.offset
                    )))
                }
            }
        }
        if let Some(unfinished) = open {
            warn!(
                group = unfinished.id,
                entries = unfinished.entries.len(),
                "discarding uncommitted oplog group"
            );
            state.abandoned_groups.insert(unfinished.id);
        }

        info!(
            entries = state.index.len(),
            last_applied = %state.last_applied,
            "opened oplog"
        );
        Ok(Self {
            log,
            state: RwLock::new(state),
        })
    }

    /// Allocates the next position.
    pub fn reserve_op_time(&self) -> OpTime {
        let mut state = self.state.write();
        let op_time = OpTime::new(state.next_timestamp, state.term);
        state.next_timestamp += 1;
        op_time
    }

    /// Entries of `entries` whose position is neither present nor already
    /// truncated away.
    pub(crate) fn fresh_entries(&self, entries: &[OplogEntry]) -> Vec<OplogEntry> {
        let state = self.state.read();
        entries
            .iter()
            .filter(|e| {
                !state.index.contains_key(&e.op_time)
                    && state.truncated_before.map_or(true, |t| e.op_time >= t)
            })
            .cloned()
            .collect()
    }

    /// Writes a group's BEGIN record, its optional rollback point and its
    /// entries. Nothing becomes visible until [`Oplog::commit_group`].
    pub(crate) fn begin_group(
        &self,
        entries: &[OplogEntry],
        roll_back_after: Option<OpTime>,
    ) -> CoreResult<OpenGroup> {
        let id = {
            let mut state = self.state.write();
            let id = state.next_group;
            state.next_group += 1;
            id
        };

        let mut records = Vec::with_capacity(entries.len() + 2);
        records.push((KIND_BEGIN, encode_document(&group_doc(id))?));
        if let Some(after) = roll_back_after {
            records.push((KIND_ROLLBACK, encode_document(&after.to_document())?));
        }
        for entry in entries {
            records.push((KIND_ENTRY, encode_document(&entry.to_document())?));
        }
        let offsets = match self.log.append_batch(&records) {
            Ok(offsets) => offsets,
            Err(e) => {
                self.abandon_group(OpenGroup::new(id));
                return Err(e);
            }
        };

        let first_entry = records.len() - entries.len();
        Ok(OpenGroup {
            id,
            entries: entries
                .iter()
                .zip(&offsets[first_entry..])
                .map(|(entry, offset)| (entry.op_time, *offset))
                .collect(),
            roll_back_after,
        })
    }

    /// Writes the COMMIT record of `group` and makes its effects visible.
    ///
    /// Returns how many entries became visible.
    pub(crate) fn commit_group(&self, group: OpenGroup) -> CoreResult<usize> {
        if let Err(e) = self.log.append(KIND_COMMIT, &encode_document(&group_doc(group.id))?) {
            self.abandon_group(group);
            return Err(e);
        }
        let mut state = self.state.write();
        state.apply(&group);
        debug!(group = group.id, entries = group.entries.len(), "committed oplog group");
        Ok(group.entries.len())
    }

    /// Records that `group` will never commit.
    pub(crate) fn abandon_group(&self, group: OpenGroup) {
        debug!(group = group.id, "abandoned oplog group");
        self.state.write().abandoned_groups.insert(group.id);
    }

    /// True if the group's COMMIT record was written.
    pub(crate) fn is_committed_group(&self, id: GroupId) -> bool {
        let state = self.state.read();
        id < state.next_group && !state.abandoned_groups.contains(&id)
    }

    /// Writes `entries` as one committed group, skipping any position
    /// already present.
    #[cfg(test)]
    pub(crate) fn append_entries(&self, entries: &[OplogEntry]) -> CoreResult<usize> {
        let fresh = self.fresh_entries(entries);
        if fresh.is_empty() {
            return Ok(0);
        }
        let group = self.begin_group(&fresh, None)?;
        self.commit_group(group)
    }

    /// Live entries strictly after `op_time`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be read.
    pub fn entries_after(&self, op_time: OpTime) -> CoreResult<Vec<OplogEntry>> {
        let positions: Vec<OpTime> = self
            .state
            .read()
            .index
            .range((Bound::Excluded(op_time), Bound::Unbounded))
            .map(|(t, _)| *t)
            .collect();
        self.read_all(positions)
    }

    /// Looks up the entry at `op_time`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored record cannot be read or decoded.
    pub fn find(&self, op_time: OpTime) -> CoreResult<Option<OplogEntry>> {
        let Some(offset) = self.state.read().index.get(&op_time).copied() else {
            return Ok(None);
        };
        let record = self.log.read_at(offset)?;
        let entry = OplogEntry::from_document(&decode_document(&record.payload)?)?;
        if entry.op_time != op_time {
            return Err(CoreError::oplog_corruption(format!(
                "index points {op_time} at an entry for {}",
                entry.op_time
            )));
        }
        Ok(Some(entry))
    }

    /// Discards every entry strictly before `op_time`.
    ///
    /// Returns the number of entries dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the retention marker cannot be written.
    pub fn truncate_before(&self, op_time: OpTime) -> CoreResult<usize> {
        self.log
            .append(KIND_TRUNCATE, &encode_document(&op_time.to_document())?)?;
        let mut state = self.state.write();
        let dropped = state.truncate(op_time);
        info!(before = %op_time, dropped, "truncated oplog");
        Ok(dropped)
    }

    /// Reader over one transaction's statements, newest first.
    #[must_use]
    pub fn history(&self, start: OpTime) -> TransactionHistoryIterator<'_> {
        TransactionHistoryIterator::new(self, start)
    }

    /// All live entries in position order.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be read.
    pub fn entries(&self) -> CoreResult<Vec<OplogEntry>> {
        let positions: Vec<OpTime> = self.state.read().index.keys().copied().collect();
        self.read_all(positions)
    }

    fn read_all(&self, positions: Vec<OpTime>) -> CoreResult<Vec<OplogEntry>> {
        let mut entries = Vec::with_capacity(positions.len());
        for op_time in positions {
            if let Some(entry) = self.find(op_time)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Newest position ever written.
    #[must_use]
    pub fn last_applied(&self) -> OpTime {
        self.state.read().last_applied
    }

    /// Oldest live position.
    #[must_use]
    pub fn first_op_time(&self) -> Option<OpTime> {
        self.state.read().index.keys().next().copied()
    }

    /// Current retention point.
    #[must_use]
    pub fn truncated_before(&self) -> Option<OpTime> {
        self.state.read().truncated_before
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    /// True if no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the underlying log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size_bytes(&self) -> CoreResult<u64> {
        self.log.size()
    }
}

impl OplogState {
    fn apply(&mut self, group: &OpenGroup) {
        if let Some(after) = group.roll_back_after {
            let dropped = self.roll_back_after(after);
            info!(after = %after, dropped, "rolled back oplog");
        }
        for (op_time, offset) in &group.entries {
            self.observe(*op_time);
            if self.truncated_before.map_or(true, |t| *op_time >= t) {
                self.index.insert(*op_time, *offset);
            }
        }
    }

    fn roll_back_after(&mut self, after: OpTime) -> usize {
        let first_removed = self
            .index
            .range((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .map(|(t, _)| *t);
        let Some(first_removed) = first_removed else {
            return 0;
        };
        let dropped = self.index.split_off(&first_removed).len();
        self.last_applied = self.index.keys().next_back().copied().unwrap_or(after);
        dropped
    }

    fn observe(&mut self, op_time: OpTime) {
        if op_time > self.last_applied {
            self.last_applied = op_time;
        }
        if op_time.term() > self.term {
            self.term = op_time.term();
        }
        if op_time.timestamp() >= self.next_timestamp {
            self.next_timestamp = op_time.timestamp() + 1;
        }
    }

    fn truncate(&mut self, before: OpTime) -> usize {
        self.observe_bound(before);
        let kept = self.index.split_off(&before);
        let dropped = self.index.len();
        self.index = kept;
        if self.truncated_before.map_or(true, |t| before > t) {
            self.truncated_before = Some(before);
        }
        dropped
    }

    fn observe_bound(&mut self, before: OpTime) {
        if before.timestamp() > self.next_timestamp {
            self.next_timestamp = before.timestamp();
        }
    }
}

fn group_doc(id: GroupId) -> Document {
    Document::new().with("g", id as i64)
}

fn group_id(doc: &Document) -> CoreResult<GroupId> {
    let raw = doc.require_i64("g")?;
    GroupId::try_from(raw)
        .map_err(|_| CoreError::oplog_corruption(format!("negative group id {raw}")))
}

fn outside_group(what: &str, offset: u64) -> CoreError {
    CoreError::oplog_corruption(format!("{what} record at offset {offset} is outside a group"))
}
