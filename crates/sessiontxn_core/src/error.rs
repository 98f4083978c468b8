//! Error types for session transaction tracking.

use crate::types::{LogicalSessionId, OpTime, StmtId, TxnNumber};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while tracking session transactions.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] sessiontxn_storage::StorageError),

    /// Document codec error.
    #[error("codec error: {0}")]
    Codec(#[from] sessiontxn_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A transaction number older than the session's active one was used.
    #[error(
        "cannot start transaction {requested} on session {session} because a newer \
         transaction {active} has already started"
    )]
    StaleTransaction {
        /// Session the request was made on.
        session: LogicalSessionId,
        /// Transaction number the caller asked for.
        requested: TxnNumber,
        /// Currently active transaction number.
        active: TxnNumber,
    },

    /// A newer transaction number was used while a multi-statement transaction
    /// is still mid-flight.
    #[error(
        "cannot start transaction {requested} on session {session} because \
         multi-document transaction {active} is in progress"
    )]
    ConflictingTransaction {
        /// Session the request was made on.
        session: LogicalSessionId,
        /// Transaction number the caller asked for.
        requested: TxnNumber,
        /// Transaction number still in progress.
        active: TxnNumber,
    },

    /// The in-memory session view was invalidated mid-operation.
    #[error("session {session} was concurrently modified and the operation must be retried")]
    ConcurrentModification {
        /// Session that was invalidated.
        session: LogicalSessionId,
    },

    /// A different transaction became active while the caller was working.
    #[error(
        "cannot perform operations on transaction {requested} on session {session} \
         because a different transaction {active} is now active"
    )]
    TransactionNotActive {
        /// Session the request was made on.
        session: LogicalSessionId,
        /// Transaction number the caller asked about.
        requested: TxnNumber,
        /// Currently active transaction number.
        active: TxnNumber,
    },

    /// Part of the statement history was truncated away.
    #[error("incomplete transaction history: {message}")]
    IncompleteHistory {
        /// Description of the missing history.
        message: String,
    },

    /// The durable history record was changed by someone else.
    #[error("write conflict: {message}")]
    WriteConflict {
        /// Description of the conflict.
        message: String,
    },

    /// The same statement was recorded twice at different positions.
    ///
    /// This is a consistency violation; callers must stop the process.
    #[error(
        "statement {stmt_id} of transaction {txn_number} on session {session} was \
         committed once at {first} and a second time at {second}"
    )]
    DuplicateStatement {
        /// Session the statement belongs to.
        session: LogicalSessionId,
        /// Transaction the statement belongs to.
        txn_number: TxnNumber,
        /// Statement id.
        stmt_id: StmtId,
        /// Position recorded first.
        first: OpTime,
        /// Conflicting second position.
        second: OpTime,
    },

    /// The caller's transaction was aborted or superseded.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// The request is not allowed in this context.
    #[error("illegal operation: {message}")]
    IllegalOperation {
        /// Description of the violation.
        message: String,
    },

    /// The request carried options that cannot be used here.
    #[error("invalid options: {message}")]
    InvalidOptions {
        /// Description of the bad option.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The operation was killed while waiting.
    #[error("operation was interrupted")]
    Interrupted,

    /// A log file is corrupted or invalid.
    #[error("{log} corruption: {message}")]
    LogCorruption {
        /// Which log.
        log: &'static str,
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Another process holds the data directory.
    #[error("data directory locked: another process has exclusive access")]
    DataDirLocked,

    /// Invalid on-disk format or version.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },
}

impl CoreError {
    /// Creates an incomplete history error.
    pub fn incomplete_history(message: impl Into<String>) -> Self {
        Self::IncompleteHistory {
            message: message.into(),
        }
    }

    /// Creates a write conflict error.
    pub fn write_conflict(message: impl Into<String>) -> Self {
        Self::WriteConflict {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an illegal operation error.
    pub fn illegal_operation(message: impl Into<String>) -> Self {
        Self::IllegalOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid options error.
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an oplog corruption error.
    pub fn oplog_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            log: "oplog",
            message: message.into(),
        }
    }

    /// Creates a transaction table corruption error.
    pub fn table_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            log: "transaction table",
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// True for errors after which the process must not keep serving.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStatement { .. }
                | Self::LogCorruption { .. }
                | Self::ChecksumMismatch { .. }
        )
    }

    /// True for errors the client may resolve by retrying the same request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. }
                | Self::TransactionNotActive { .. }
                | Self::WriteConflict { .. }
        )
    }
}
