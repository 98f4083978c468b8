//! The operation log: entries, durable storage and per-transaction history.

mod entry;
mod history;
mod store;

pub use entry::{
    dead_end_sentinel, OpType, OperationSessionInfo, OplogEntry, ReplOperation,
    APPLY_OPS_COMMAND, COMMAND_NS, INCOMPLETE_HISTORY_KEY,
};
pub use history::TransactionHistoryIterator;
pub use store::Oplog;
pub(crate) use store::GroupId;
