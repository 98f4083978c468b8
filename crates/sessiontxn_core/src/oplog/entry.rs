//! Oplog entry model and its document form.

use crate::types::{LogicalSessionId, OpTime, StmtId, TxnNumber, WallClockTime};
use sessiontxn_codec::{CodecError, CodecResult, Document, Value};
use std::fmt;

/// Namespace of command entries.
pub const COMMAND_NS: &str = "admin.$cmd";

/// Command name of a multi-statement transaction commit entry.
pub const APPLY_OPS_COMMAND: &str = "applyOps";

/// Key of the dead-end sentinel document.
pub const INCOMPLETE_HISTORY_KEY: &str = "$incompleteOplogHistory";

/// `{ $incompleteOplogHistory: 1 }`, carried in `o2` of an entry that marks
/// the point where earlier statement history was lost.
#[must_use]
pub fn dead_end_sentinel() -> Document {
    Document::new().with(INCOMPLETE_HISTORY_KEY, 1i64)
}

/// Kind of change an oplog entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    /// Document insert.
    Insert,
    /// Document update.
    Update,
    /// Document delete.
    Delete,
    /// Command, such as `applyOps`.
    Command,
    /// No-op; used for migrated history and sentinels.
    Noop,
}

impl OpType {
    /// Single-letter wire code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Delete => "d",
            Self::Command => "c",
            Self::Noop => "n",
        }
    }

    /// Parses a wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Self::Insert),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            "c" => Some(Self::Command),
            "n" => Some(Self::Noop),
            _ => None,
        }
    }

    fn parse(doc: &Document, key: &str) -> CodecResult<Self> {
        let code = doc.require_text(key)?;
        Self::from_code(code)
            .ok_or_else(|| CodecError::decoding_failed(format!("unknown op type '{code}'")))
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session fields attached to an entry written on behalf of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperationSessionInfo {
    /// Owning session.
    pub session_id: Option<LogicalSessionId>,
    /// Transaction number within the session.
    pub txn_number: Option<TxnNumber>,
}

/// One change inside a multi-statement transaction, buffered until commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplOperation {
    /// Kind of change.
    pub op_type: OpType,
    /// Target namespace.
    pub ns: String,
    /// Primary payload.
    pub object: Document,
    /// Secondary payload, e.g. an update's query.
    pub object2: Option<Document>,
}

impl ReplOperation {
    /// Creates an operation without a secondary payload.
    pub fn new(op_type: OpType, ns: impl Into<String>, object: Document) -> Self {
        Self {
            op_type,
            ns: ns.into(),
            object,
            object2: None,
        }
    }

    /// Sets the secondary payload.
    #[must_use]
    pub fn with_object2(mut self, object2: Document) -> Self {
        self.object2 = Some(object2);
        self
    }

    /// `{ op, ns, o, o2? }`
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new()
            .with("op", self.op_type.as_str())
            .with("ns", self.ns.as_str())
            .with("o", self.object.clone());
        if let Some(o2) = &self.object2 {
            doc.insert("o2", o2.clone());
        }
        doc
    }

    /// Parses `{ op, ns, o, o2? }`.
    ///
    /// # Errors
    ///
    /// Returns an error on missing or mistyped fields.
    pub fn from_document(doc: &Document) -> CodecResult<Self> {
        Ok(Self {
            op_type: OpType::parse(doc, "op")?,
            ns: doc.require_text("ns")?.to_string(),
            object: doc.require_document("o")?.clone(),
            object2: doc.optional_document("o2")?.cloned(),
        })
    }
}

/// A single oplog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Position in the oplog.
    pub op_time: OpTime,
    /// Kind of change.
    pub op_type: OpType,
    /// Target namespace.
    pub ns: String,
    /// Primary payload (`o`).
    pub object: Document,
    /// Secondary payload (`o2`).
    pub object2: Option<Document>,
    /// Upsert flag for updates (`b`).
    pub upsert: Option<bool>,
    /// Session that wrote the entry.
    pub session_info: OperationSessionInfo,
    /// Statement id within the transaction.
    pub statement_id: Option<StmtId>,
    /// Previous write of the same transaction; null ends the chain.
    pub prev_write_op_time: Option<OpTime>,
    /// Wall-clock time of the write.
    pub wall_clock_time: Option<WallClockTime>,
}

impl OplogEntry {
    /// Creates a bare entry.
    pub fn new(op_time: OpTime, op_type: OpType, ns: impl Into<String>, object: Document) -> Self {
        Self {
            op_time,
            op_type,
            ns: ns.into(),
            object,
            object2: None,
            upsert: None,
            session_info: OperationSessionInfo::default(),
            statement_id: None,
            prev_write_op_time: None,
            wall_clock_time: None,
        }
    }

    /// Builds the command entry that commits a multi-statement transaction.
    pub fn apply_ops(op_time: OpTime, operations: &[ReplOperation]) -> Self {
        let ops: Vec<Value> = operations
            .iter()
            .map(|op| Value::Document(op.to_document()))
            .collect();
        Self::new(
            op_time,
            OpType::Command,
            COMMAND_NS,
            Document::new().with(APPLY_OPS_COMMAND, ops),
        )
    }

    /// Sets `o2`.
    #[must_use]
    pub fn with_object2(mut self, object2: Document) -> Self {
        self.object2 = Some(object2);
        self
    }

    /// Sets the upsert flag.
    #[must_use]
    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = Some(upsert);
        self
    }

    /// Attaches session and transaction number.
    #[must_use]
    pub fn with_session(mut self, session_id: LogicalSessionId, txn_number: TxnNumber) -> Self {
        self.session_info = OperationSessionInfo {
            session_id: Some(session_id),
            txn_number: Some(txn_number),
        };
        self
    }

    /// Sets the statement id.
    #[must_use]
    pub fn with_statement_id(mut self, stmt_id: StmtId) -> Self {
        self.statement_id = Some(stmt_id);
        self
    }

    /// Links to the previous write of the same transaction.
    #[must_use]
    pub fn with_prev_write_op_time(mut self, prev: OpTime) -> Self {
        self.prev_write_op_time = Some(prev);
        self
    }

    /// Sets the wall-clock time.
    #[must_use]
    pub fn with_wall_clock_time(mut self, wall: WallClockTime) -> Self {
        self.wall_clock_time = Some(wall);
        self
    }

    /// Command name, for command entries.
    #[must_use]
    pub fn command_name(&self) -> Option<&str> {
        if self.op_type == OpType::Command {
            self.object.first_key()
        } else {
            None
        }
    }

    /// True for a transaction commit entry.
    #[must_use]
    pub fn is_apply_ops(&self) -> bool {
        self.command_name() == Some(APPLY_OPS_COMMAND)
    }

    /// Operations carried by an `applyOps` entry.
    ///
    /// # Errors
    ///
    /// Returns an error if this is not an `applyOps` entry or an element is
    /// malformed.
    pub fn apply_ops_operations(&self) -> CodecResult<Vec<ReplOperation>> {
        let Some(Value::Array(items)) = self.object.get(APPLY_OPS_COMMAND) else {
            return Err(CodecError::missing_field(APPLY_OPS_COMMAND));
        };
        items
            .iter()
            .map(|item| {
                item.as_document()
                    .ok_or_else(|| CodecError::decoding_failed("applyOps element is not a document"))
                    .and_then(ReplOperation::from_document)
            })
            .collect()
    }

    /// True if this entry marks lost statement history.
    #[must_use]
    pub fn is_dead_end_sentinel(&self) -> bool {
        self.statement_id == Some(crate::types::INCOMPLETE_HISTORY_STMT_ID)
            && self.object2.as_ref() == Some(&dead_end_sentinel())
    }

    /// Document form as stored in the oplog.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new()
            .with("ts", self.op_time.timestamp() as i64)
            .with("t", self.op_time.term())
            .with("op", self.op_type.as_str())
            .with("ns", self.ns.as_str())
            .with("o", self.object.clone());
        if let Some(o2) = &self.object2 {
            doc.insert("o2", o2.clone());
        }
        if let Some(upsert) = self.upsert {
            doc.insert("b", upsert);
        }
        if let Some(lsid) = &self.session_info.session_id {
            doc.insert("lsid", lsid.to_document());
        }
        if let Some(txn) = self.session_info.txn_number {
            doc.insert("txnNumber", txn);
        }
        if let Some(stmt) = self.statement_id {
            doc.insert("stmtId", stmt);
        }
        if let Some(prev) = &self.prev_write_op_time {
            doc.insert("prevOpTime", prev.to_document());
        }
        if let Some(wall) = self.wall_clock_time {
            doc.insert("wall", wall.as_millis());
        }
        doc
    }

    /// Parses the stored document form.
    ///
    /// # Errors
    ///
    /// Returns an error on missing or mistyped fields.
    pub fn from_document(doc: &Document) -> CodecResult<Self> {
        let op_time = OpTime::from_document(doc)?;
        let session_id = doc
            .optional_document("lsid")?
            .map(LogicalSessionId::from_document)
            .transpose()?;
        let statement_id = doc
            .optional_i64("stmtId")?
            .map(|v| {
                StmtId::try_from(v).map_err(|_| CodecError::decoding_failed(format!("stmtId {v}")))
            })
            .transpose()?;
        let upsert = match doc.get("b") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_bool().ok_or_else(|| CodecError::InvalidField {
                field: "b".to_string(),
                expected: "bool",
                found: v.type_name(),
            })?),
        };

        Ok(Self {
            op_time,
            op_type: OpType::parse(doc, "op")?,
            ns: doc.require_text("ns")?.to_string(),
            object: doc.require_document("o")?.clone(),
            object2: doc.optional_document("o2")?.cloned(),
            upsert,
            session_info: OperationSessionInfo {
                session_id,
                txn_number: doc.optional_i64("txnNumber")?,
            },
            statement_id,
            prev_write_op_time: doc
                .optional_document("prevOpTime")?
                .map(OpTime::from_document)
                .transpose()?,
            wall_clock_time: doc.optional_i64("wall")?.map(WallClockTime::from_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::INCOMPLETE_HISTORY_STMT_ID;

    #[test]
    fn session_fields_survive_document_form() {
        let lsid = LogicalSessionId::new("u");
        let entry = OplogEntry::new(
            OpTime::new(7, 1),
            OpType::Update,
            "test.coll",
            Document::new().with("$set", Document::new().with("x", 1i64)),
        )
        .with_object2(Document::new().with("_id", 3i64))
        .with_session(lsid, 4)
        .with_statement_id(2)
        .with_prev_write_op_time(OpTime::new(5, 1))
        .with_wall_clock_time(WallClockTime::from_millis(1_000));

        let parsed = OplogEntry::from_document(&entry.to_document()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn apply_ops_carries_operations() {
        let ops = vec![
            ReplOperation::new(OpType::Insert, "test.a", Document::new().with("_id", 1i64)),
            ReplOperation::new(OpType::Delete, "test.b", Document::new().with("_id", 2i64)),
        ];
        let entry = OplogEntry::apply_ops(OpTime::new(9, 1), &ops);
        assert!(entry.is_apply_ops());
        assert_eq!(entry.ns, COMMAND_NS);
        assert_eq!(entry.apply_ops_operations().unwrap(), ops);
    }

    #[test]
    fn non_command_has_no_command_name() {
        let entry = OplogEntry::new(OpTime::new(1, 1), OpType::Insert, "t.c", Document::new());
        assert_eq!(entry.command_name(), None);
        assert!(!entry.is_apply_ops());
    }

    #[test]
    fn sentinel_needs_both_markers() {
        let base = OplogEntry::new(
            OpTime::new(1, 1),
            OpType::Noop,
            "t.c",
            Document::new().with("$sessionMigrateInfo", 1i64),
        );
        let sentinel = base
            .clone()
            .with_object2(dead_end_sentinel())
            .with_statement_id(INCOMPLETE_HISTORY_STMT_ID);
        assert!(sentinel.is_dead_end_sentinel());
        assert!(!base.clone().with_statement_id(INCOMPLETE_HISTORY_STMT_ID).is_dead_end_sentinel());
        assert!(!base.with_object2(dead_end_sentinel()).with_statement_id(0).is_dead_end_sentinel());
    }

    #[test]
    fn unknown_op_code_rejected() {
        let mut doc = OplogEntry::new(OpTime::new(1, 1), OpType::Insert, "t.c", Document::new())
            .to_document();
        doc.insert("op", "z");
        assert!(OplogEntry::from_document(&doc).is_err());
    }
}
