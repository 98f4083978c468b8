//! Walks one transaction's statements backward through the oplog.

use super::{Oplog, OplogEntry};
use crate::error::{CoreError, CoreResult};
use crate::types::OpTime;

/// Follows the `prevOpTime` links of a transaction's oplog entries, newest
/// first, until the null optime.
///
/// Running off the end of the chain and finding a link that points at a
/// truncated entry are different outcomes: the former ends iteration, the
/// latter yields [`CoreError::IncompleteHistory`].
pub struct TransactionHistoryIterator<'a> {
    oplog: &'a Oplog,
    next_op_time: OpTime,
}

impl<'a> TransactionHistoryIterator<'a> {
    /// Starts at `start`; a null start yields nothing.
    #[must_use]
    pub fn new(oplog: &'a Oplog, start: OpTime) -> Self {
        Self {
            oplog,
            next_op_time: start,
        }
    }

    /// True while the chain has not reached the null optime.
    #[must_use]
    pub fn has_next(&self) -> bool {
        !self.next_op_time.is_null()
    }

    /// Returns the next entry and advances along its back link.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IncompleteHistory`] if the linked entry is no
    /// longer in the oplog.
    pub fn next_entry(&mut self) -> CoreResult<OplogEntry> {
        if !self.has_next() {
            return Err(CoreError::invalid_operation(
                "transaction history iterator is exhausted",
            ));
        }
        let op_time = self.next_op_time;
        let Some(entry) = self.oplog.find(op_time)? else {
            self.next_op_time = OpTime::null();
            return Err(CoreError::incomplete_history(format!(
                "oplog no longer contains the complete write history of this transaction, \
                 possibly because the entry at {op_time} was truncated"
            )));
        };
        let Some(prev) = entry.prev_write_op_time else {
            self.next_op_time = OpTime::null();
            return Err(CoreError::oplog_corruption(format!(
                "entry at {op_time} is missing the link to the previous write in its transaction"
            )));
        };
        self.next_op_time = prev;
        Ok(entry)
    }
}

impl Iterator for TransactionHistoryIterator<'_> {
    type Item = CoreResult<OplogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.has_next().then(|| self.next_entry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OpType;
    use crate::types::LogicalSessionId;
    use sessiontxn_codec::Document;
    use sessiontxn_storage::InMemoryBackend;

    fn chain(oplog: &Oplog, len: usize) -> Vec<OpTime> {
        let lsid = LogicalSessionId::new("u");
        let mut prev = OpTime::null();
        let mut times = Vec::new();
        for stmt in 0..len {
            let t = oplog.reserve_op_time();
            let e = OplogEntry::new(t, OpType::Insert, "t.c", Document::new())
                .with_session(lsid, 1)
                .with_statement_id(stmt as i32)
                .with_prev_write_op_time(prev);
            oplog.append_entries(&[e]).unwrap();
            prev = t;
            times.push(t);
        }
        times
    }

    #[test]
    fn walks_newest_first() {
        let oplog = Oplog::open(Box::new(InMemoryBackend::new()), false).unwrap();
        let times = chain(&oplog, 3);
        let stmts: Vec<i32> = oplog
            .history(times[2])
            .map(|e| e.unwrap().statement_id.unwrap())
            .collect();
        assert_eq!(stmts, vec![2, 1, 0]);
    }

    #[test]
    fn null_start_is_empty() {
        let oplog = Oplog::open(Box::new(InMemoryBackend::new()), false).unwrap();
        let mut it = oplog.history(OpTime::null());
        assert!(!it.has_next());
        assert!(it.next().is_none());
    }

    #[test]
    fn truncated_link_is_incomplete_not_end() {
        let oplog = Oplog::open(Box::new(InMemoryBackend::new()), false).unwrap();
        let times = chain(&oplog, 3);
        oplog.truncate_before(times[1]).unwrap();

        let mut it = oplog.history(times[2]);
        assert_eq!(it.next_entry().unwrap().statement_id, Some(2));
        assert_eq!(it.next_entry().unwrap().statement_id, Some(1));
        assert!(it.has_next());
        assert!(matches!(
            it.next_entry(),
            Err(CoreError::IncompleteHistory { .. })
        ));
        assert!(!it.has_next());
    }
}
