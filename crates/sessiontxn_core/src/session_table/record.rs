use crate::types::{LogicalSessionId, OpTime, TxnNumber, WallClockTime};
use sessiontxn_codec::{CodecResult, Document};

/// Namespace of the session transaction table.
pub const SESSION_TRANSACTIONS_NS: &str = "config.transactions";

/// One row of the session transaction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTxnRecord {
    /// Primary key.
    pub session_id: LogicalSessionId,
    /// Newest transaction number that wrote through this session.
    pub txn_num: TxnNumber,
    /// Oplog position of that transaction's latest write.
    pub last_write_op_time: OpTime,
    /// Wall-clock time of that write.
    pub last_write_date: WallClockTime,
}

impl SessionTxnRecord {
    /// `{ _id: <lsid>, txnNum, lastWriteOpTime: { ts, t }, lastWriteDate }`
    #[must_use]
    pub fn to_document(&self) -> Document {
        Document::new()
            .with("_id", self.session_id.to_document())
            .with("txnNum", self.txn_num)
            .with("lastWriteOpTime", self.last_write_op_time.to_document())
            .with("lastWriteDate", self.last_write_date.as_millis())
    }

    /// Parses the form written by [`SessionTxnRecord::to_document`].
    ///
    /// # Errors
    ///
    /// Returns an error on missing or mistyped fields.
    pub fn from_document(doc: &Document) -> CodecResult<Self> {
        Ok(Self {
            session_id: LogicalSessionId::from_document(doc.require_document("_id")?)?,
            txn_num: doc.require_i64("txnNum")?,
            last_write_op_time: OpTime::from_document(doc.require_document("lastWriteOpTime")?)?,
            last_write_date: WallClockTime::from_millis(doc.require_i64("lastWriteDate")?),
        })
    }

    /// The `{ _id: <lsid> }` query selecting this row.
    #[must_use]
    pub fn id_query(&self) -> Document {
        Document::new().with("_id", self.session_id.to_document())
    }
}

/// Upsert of a session's row keyed by its session id.
///
/// The row currently stored must not be newer than the replacement; a newer
/// row means another writer got there first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    /// New row contents.
    pub replacement: SessionTxnRecord,
    /// Insert when no row exists.
    pub upsert: bool,
}

impl UpdateRequest {
    /// Upsert of `replacement`.
    #[must_use]
    pub const fn upsert(replacement: SessionTxnRecord) -> Self {
        Self {
            replacement,
            upsert: true,
        }
    }

    /// Session this request targets.
    #[must_use]
    pub const fn session_id(&self) -> &LogicalSessionId {
        &self.replacement.session_id
    }

    /// True if `current` may be overwritten by this request.
    #[must_use]
    pub fn matches(&self, current: &SessionTxnRecord) -> bool {
        current.session_id == self.replacement.session_id
            && current.txn_num <= self.replacement.txn_num
            && current.last_write_op_time <= self.replacement.last_write_op_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(txn: TxnNumber, ts: u64) -> SessionTxnRecord {
        SessionTxnRecord {
            session_id: LogicalSessionId::new("u"),
            txn_num: txn,
            last_write_op_time: OpTime::new(ts, 1),
            last_write_date: WallClockTime::from_millis(10),
        }
    }

    #[test]
    fn document_form() {
        let r = record(3, 12);
        let doc = r.to_document();
        assert_eq!(doc.first_key(), Some("_id"));
        assert_eq!(SessionTxnRecord::from_document(&doc).unwrap(), r);
    }

    #[test]
    fn newer_row_does_not_match() {
        let older = record(3, 12);
        let mut newer = older;
        newer.txn_num = 4;
        newer.last_write_op_time = OpTime::new(20, 1);

        assert!(UpdateRequest::upsert(newer).matches(&older));
        assert!(!UpdateRequest::upsert(older).matches(&newer));

        let mut other_session = older;
        other_session.session_id = LogicalSessionId::new("v");
        assert!(!UpdateRequest::upsert(newer).matches(&other_session));
    }
}
