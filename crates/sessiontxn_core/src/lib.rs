//! # sessiontxn core
//!
//! Per-session transaction tracking for a replicated document store.
//!
//! This crate provides:
//! - Retryable writes: each session remembers which statements of its
//!   newest transaction committed, and where, so a retried statement is
//!   answered instead of applied twice
//! - Multi-statement transactions with a small state machine and a stash
//!   that parks storage resources between network round trips
//! - The oplog with per-transaction back links and a history reader
//! - The session transaction table and the updater that keeps it in step
//!   with replicated writes
//!
//! ## Example
//!
//! ```rust
//! use sessiontxn_core::{Client, LogicalSessionId, OperationContext, SessionCatalog, StorageEngine};
//!
//! let engine = StorageEngine::open_in_memory().unwrap();
//! let catalog = SessionCatalog::new(engine.clone());
//! let lsid = LogicalSessionId::new("alice");
//! let session = catalog.get_or_create(lsid);
//!
//! let op = OperationContext::new(Client::new("conn1"), &engine).with_session(lsid, 1);
//! session.refresh_from_storage_if_needed(&op).unwrap();
//! session.begin_or_continue_txn(&op, 1, None).unwrap();
//! assert_eq!(session.active_txn_number(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dir;
pub mod engine;
mod error;
pub mod oplog;
mod record;
pub mod replication;
mod retryability;
pub mod session;
pub mod session_table;
mod stats;
mod types;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::Config;
pub use engine::{Client, OperationContext, StorageEngine, WriteUnitOfWork};
pub use error::{CoreError, CoreResult};
pub use oplog::{OpType, OplogEntry, ReplOperation, TransactionHistoryIterator};
pub use replication::{
    add_ops_for_replicating_txn_table, create_matching_transaction_table_update, AppliedBatch,
    RolledBack, SecondaryApplier,
};
pub use retryability::SingleWriteResult;
pub use session::{Session, SessionCatalog, TxnResources, TxnState};
pub use session_table::{SessionTxnRecord, SESSION_TRANSACTIONS_NS};
pub use stats::{RetryableWritesStats, StatsSnapshot};
pub use types::{
    LogicalSessionId, OpTime, StmtId, TxnNumber, WallClockTime, INCOMPLETE_HISTORY_STMT_ID,
    UNINITIALIZED_TXN_NUMBER,
};
