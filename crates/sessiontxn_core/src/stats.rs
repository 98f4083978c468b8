//! Counters for retryable writes and multi-statement transactions.

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide transaction counters.
///
/// All counters are atomic and only ever grow.
#[derive(Debug, Default)]
pub struct RetryableWritesStats {
    /// Rows written to the session transaction table.
    transactions_collection_writes: AtomicU64,
    /// Statements found already executed on retry.
    retried_statements: AtomicU64,
    /// Multi-statement transactions started.
    transactions_started: AtomicU64,
    /// Multi-statement transactions committed.
    transactions_committed: AtomicU64,
    /// Multi-statement transactions aborted.
    transactions_aborted: AtomicU64,
    /// Session views reloaded from storage.
    session_refreshes: AtomicU64,
}

impl RetryableWritesStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transactions_collection_write(&self) {
        self.transactions_collection_writes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retried_statement(&self) {
        self.retried_statements.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_refresh(&self) {
        self.session_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    /// Rows written to the session transaction table.
    pub fn transactions_collection_writes(&self) -> u64 {
        self.transactions_collection_writes.load(Ordering::Relaxed)
    }

    /// Statements found already executed on retry.
    pub fn retried_statements(&self) -> u64 {
        self.retried_statements.load(Ordering::Relaxed)
    }

    /// Multi-statement transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Multi-statement transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Multi-statement transactions aborted.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Session views reloaded from storage.
    pub fn session_refreshes(&self) -> u64 {
        self.session_refreshes.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_collection_writes: self.transactions_collection_writes(),
            retried_statements: self.retried_statements(),
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            session_refreshes: self.session_refreshes(),
        }
    }
}

/// A point-in-time copy of [`RetryableWritesStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Rows written to the session transaction table.
    pub transactions_collection_writes: u64,
    /// Statements found already executed on retry.
    pub retried_statements: u64,
    /// Multi-statement transactions started.
    pub transactions_started: u64,
    /// Multi-statement transactions committed.
    pub transactions_committed: u64,
    /// Multi-statement transactions aborted.
    pub transactions_aborted: u64,
    /// Session views reloaded from storage.
    pub session_refreshes: u64,
}
