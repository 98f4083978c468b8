//! Storage engine: oplog, session transaction table, tickets and the
//! per-operation machinery built on them.

mod locker;
mod operation_context;
mod read_concern;
mod recovery_unit;

pub use locker::{ClientState, LockMode, Locker, LockerId, ResourceId, Ticket, TicketHolder};
pub use operation_context::{Client, ClientInfo, KillHandle, OperationContext, WriteUnitOfWork};
pub use read_concern::{ReadConcernArgs, ReadConcernLevel};
pub use recovery_unit::{Change, RecoveryUnit, RecoveryUnitId};

use crate::config::Config;
use crate::dir::{DataDir, Manifest};
use crate::error::{CoreError, CoreResult};
use crate::oplog::{Oplog, OplogEntry};
use crate::session_table::{
    RowChange, SessionTransactionTable, SessionTxnRecord, StagedTableUpdate,
};
use crate::stats::RetryableWritesStats;
use crate::types::{LogicalSessionId, OpTime};
use parking_lot::Mutex;
use sessiontxn_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns durable state and hands out recovery units and lockers.
///
/// Commits are serialized: a recovery unit's oplog entries and table rows
/// are validated and written under one engine-wide commit lock. Each commit
/// is one oplog group; its table rows carry the group id and only count once
/// the group's COMMIT record is on disk.
pub struct StorageEngine {
    config: Config,
    dir: Option<DataDir>,
    oplog: Oplog,
    session_table: SessionTransactionTable,
    tickets: Arc<TicketHolder>,
    stats: RetryableWritesStats,
    next_recovery_unit_id: AtomicU64,
    next_locker_id: AtomicU64,
    commit_lock: Mutex<()>,
}

impl StorageEngine {
    /// Opens a data directory with default configuration.
    ///
    /// # Errors
    ///
    /// See [`StorageEngine::open_with_config`].
    pub fn open(path: &Path) -> CoreResult<Arc<Self>> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is locked or missing, if its
    /// format version is incompatible, or if a log fails recovery.
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Arc<Self>> {
        let dir = DataDir::open(path, config.create_if_missing)?;
        match dir.load_manifest()? {
            Some(manifest) => {
                if manifest.format_version.0 != config.format_version.0 {
                    return Err(CoreError::invalid_format(format!(
                        "incompatible format version: data is v{}.{}, expected v{}.{}",
                        manifest.format_version.0,
                        manifest.format_version.1,
                        config.format_version.0,
                        config.format_version.1
                    )));
                }
            }
            None => {
                if !config.create_if_missing {
                    return Err(CoreError::invalid_format(
                        "data directory is not initialized and create_if_missing is false",
                    ));
                }
                dir.save_manifest(&Manifest::new(config.format_version))?;
            }
        }

        let oplog_backend = FileBackend::open(&dir.oplog_path())?;
        let table_backend = FileBackend::open(&dir.table_path())?;
        info!(path = %path.display(), "opening storage engine");
        Self::build(
            config,
            Some(dir),
            Box::new(oplog_backend),
            Box::new(table_backend),
        )
    }

    /// Opens an engine over caller-supplied backends.
    ///
    /// # Errors
    ///
    /// Returns an error if a log fails recovery or the configuration is
    /// unusable.
    pub fn open_with_backends(
        config: Config,
        oplog_backend: Box<dyn StorageBackend>,
        table_backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Arc<Self>> {
        Self::build(config, None, oplog_backend, table_backend)
    }

    /// Opens an ephemeral engine.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the other openers.
    pub fn open_in_memory() -> CoreResult<Arc<Self>> {
        Self::open_with_backends(
            Config::default(),
            Box::new(InMemoryBackend::new()),
            Box::new(InMemoryBackend::new()),
        )
    }

    fn build(
        config: Config,
        dir: Option<DataDir>,
        oplog_backend: Box<dyn StorageBackend>,
        table_backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Arc<Self>> {
        if config.execution_tickets == 0 {
            return Err(CoreError::invalid_options(
                "execution_tickets must be at least 1",
            ));
        }
        let oplog = Oplog::open(oplog_backend, config.sync_on_commit)?;
        let session_table =
            SessionTransactionTable::open(table_backend, config.sync_on_commit, |group| {
                oplog.is_committed_group(group)
            })?;
        Ok(Arc::new(Self {
            tickets: Arc::new(TicketHolder::new(config.execution_tickets)),
            config,
            dir,
            oplog,
            session_table,
            stats: RetryableWritesStats::new(),
            next_recovery_unit_id: AtomicU64::new(1),
            next_locker_id: AtomicU64::new(1),
            commit_lock: Mutex::new(()),
        }))
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Data directory, for file-backed engines.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(DataDir::path)
    }

    /// The oplog.
    #[must_use]
    pub const fn oplog(&self) -> &Oplog {
        &self.oplog
    }

    /// The session transaction table.
    #[must_use]
    pub const fn session_table(&self) -> &SessionTransactionTable {
        &self.session_table
    }

    /// Execution ticket pool.
    #[must_use]
    pub const fn tickets(&self) -> &Arc<TicketHolder> {
        &self.tickets
    }

    /// Transaction counters.
    #[must_use]
    pub const fn stats(&self) -> &RetryableWritesStats {
        &self.stats
    }

    /// Creates a recovery unit not yet in a unit of work.
    #[must_use]
    pub fn new_recovery_unit(self: &Arc<Self>) -> RecoveryUnit {
        let id = self.next_recovery_unit_id.fetch_add(1, Ordering::Relaxed);
        RecoveryUnit::new(RecoveryUnitId(id), Arc::clone(self))
    }

    /// Creates a locker holding nothing.
    #[must_use]
    pub fn new_locker(&self) -> Locker {
        Locker::new(LockerId(self.next_locker_id.fetch_add(1, Ordering::Relaxed)))
    }

    pub(crate) fn commit_staged(
        &self,
        oplog_entries: &[OplogEntry],
        table_updates: &[StagedTableUpdate],
    ) -> CoreResult<()> {
        if oplog_entries.is_empty() && table_updates.is_empty() {
            return Ok(());
        }
        let _commit = self.commit_lock.lock();
        self.session_table.validate(table_updates)?;
        let fresh = self.oplog.fresh_entries(oplog_entries);
        let changes: Vec<RowChange> = table_updates
            .iter()
            .map(|update| RowChange::Upsert(update.request.replacement))
            .collect();
        self.write_group(&fresh, &changes, None)?;
        debug!(
            oplog_entries = fresh.len(),
            table_rows = changes.len(),
            "committed staged writes"
        );
        Ok(())
    }

    /// Writes replicated entries and table rows.
    ///
    /// Returns how many oplog entries and rows actually changed; replaying
    /// the same or an earlier batch again changes nothing.
    pub(crate) fn apply_replicated(
        &self,
        oplog_entries: &[OplogEntry],
        rows: &[SessionTxnRecord],
    ) -> CoreResult<(usize, usize)> {
        let _commit = self.commit_lock.lock();
        let fresh = self.oplog.fresh_entries(oplog_entries);
        let changes = self.session_table.replicated_changes(rows);
        let written = self.write_group(&fresh, &changes, None)?;
        Ok((written, changes.len()))
    }

    /// Removes every oplog entry after `common_point` and reverts the table
    /// rows that pointed past it.
    ///
    /// A reverted row takes the newest surviving entry of its session that
    /// carries a transaction number, or is removed if there is none. Returns
    /// the removed entries, oldest first.
    pub(crate) fn roll_back_after(&self, common_point: OpTime) -> CoreResult<Vec<OplogEntry>> {
        let _commit = self.commit_lock.lock();
        let removed = self.oplog.entries_after(common_point)?;
        let stale: Vec<LogicalSessionId> = self
            .session_table
            .records()
            .into_iter()
            .filter(|row| row.last_write_op_time > common_point)
            .map(|row| row.session_id)
            .collect();
        if removed.is_empty() && stale.is_empty() {
            return Ok(removed);
        }

        let mut survivors: HashMap<LogicalSessionId, SessionTxnRecord> = HashMap::new();
        if !stale.is_empty() {
            for entry in self.oplog.entries()? {
                if entry.op_time > common_point {
                    break;
                }
                let info = entry.session_info;
                if let (Some(session_id), Some(txn_num)) = (info.session_id, info.txn_number) {
                    survivors.insert(
                        session_id,
                        SessionTxnRecord {
                            session_id,
                            txn_num,
                            last_write_op_time: entry.op_time,
                            last_write_date: entry.wall_clock_time.unwrap_or_default(),
                        },
                    );
                }
            }
        }
        let changes: Vec<RowChange> = stale
            .iter()
            .map(|lsid| match survivors.get(lsid) {
                Some(row) => RowChange::Upsert(*row),
                None => RowChange::Remove(*lsid),
            })
            .collect();

        self.write_group(&[], &changes, Some(common_point))?;
        info!(
            after = %common_point,
            entries = removed.len(),
            rows = changes.len(),
            "rolled back storage"
        );
        Ok(removed)
    }

    /// Writes one oplog group and its table rows, then makes both visible.
    ///
    /// Must be called under the commit lock. If any write fails, neither the
    /// entries nor the rows are visible now or after reopening.
    fn write_group(
        &self,
        entries: &[OplogEntry],
        changes: &[RowChange],
        roll_back_after: Option<OpTime>,
    ) -> CoreResult<usize> {
        if entries.is_empty() && changes.is_empty() && roll_back_after.is_none() {
            return Ok(0);
        }
        let group = self.oplog.begin_group(entries, roll_back_after)?;
        if let Err(e) = self.session_table.append_group_rows(group.id(), changes) {
            self.oplog.abandon_group(group);
            return Err(e);
        }
        let written = self.oplog.commit_group(group)?;
        self.session_table.install(changes);
        Ok(written)
    }
}
