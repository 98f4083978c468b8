//! Durable per-session record of the last retryable write.

mod record;
mod table;

pub use record::{SessionTxnRecord, UpdateRequest, SESSION_TRANSACTIONS_NS};
pub use table::SessionTransactionTable;
pub(crate) use table::{RowChange, StagedTableUpdate};
