//! Replies for retried statements that already executed.

use crate::error::{CoreError, CoreResult};
use crate::oplog::{OpType, OplogEntry};
use sessiontxn_codec::{Document, Value};

/// Reply of one write statement, reconstructed from its oplog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleWriteResult {
    /// Documents matched.
    pub n: u64,
    /// Documents modified.
    pub n_modified: u64,
    /// `{ _id: .. }` of a document inserted by an upsert.
    pub upserted_id: Option<Document>,
}

impl SingleWriteResult {
    /// Reply of an insert.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `entry` is not an insert.
    pub fn for_insert(entry: &OplogEntry) -> CoreResult<Self> {
        expect_op_type(entry, &[OpType::Insert])?;
        Ok(Self::matched(0))
    }

    /// Reply of an update. Upserts are logged as inserts and report the
    /// inserted `_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `entry` is neither an
    /// insert nor an update.
    pub fn for_update(entry: &OplogEntry) -> CoreResult<Self> {
        expect_op_type(entry, &[OpType::Insert, OpType::Update])?;
        if entry.op_type == OpType::Update {
            return Ok(Self::matched(1));
        }
        let id = entry.object.get("_id").cloned().unwrap_or(Value::Null);
        Ok(Self {
            upserted_id: Some(Document::new().with("_id", id)),
            ..Self::matched(0)
        })
    }

    /// Reply of a delete.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `entry` is not a delete.
    pub fn for_delete(entry: &OplogEntry) -> CoreResult<Self> {
        expect_op_type(entry, &[OpType::Delete])?;
        Ok(Self::matched(0))
    }

    const fn matched(n_modified: u64) -> Self {
        Self {
            n: 1,
            n_modified,
            upserted_id: None,
        }
    }
}

fn expect_op_type(entry: &OplogEntry, allowed: &[OpType]) -> CoreResult<()> {
    if allowed.contains(&entry.op_type) {
        Ok(())
    } else {
        Err(CoreError::invalid_operation(format!(
            "oplog entry at {} is a {} and cannot answer this retry",
            entry.op_time,
            entry.op_type.as_str()
        )))
    }
}
