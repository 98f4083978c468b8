//! Verify command implementation.

use super::open_existing;
use sessiontxn_core::{Client, CoreError, OperationContext, SessionCatalog, StorageEngine};
use std::path::Path;
use std::sync::Arc;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Oplog entries decoded.
    pub entries_checked: usize,
    /// Session records checked.
    pub sessions_checked: usize,
    /// Sessions whose history runs into truncated entries.
    pub incomplete_histories: usize,
    /// Problems found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
///
/// Opening the data directory replays both logs and checks every record's
/// checksum. Each session's history is then loaded the way a server would
/// load it; a statement recorded twice is returned as an error.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying data directory at {}", path.display());
    println!();

    let engine = open_existing(path)?;
    let result = verify(&engine)?;

    println!("Oplog entries:      {}", result.entries_checked);
    println!("Sessions:           {}", result.sessions_checked);
    println!("Incomplete history: {}", result.incomplete_histories);
    if result.is_ok() {
        println!();
        println!("Verification passed.");
        return Ok(());
    }
    println!();
    println!("Errors:");
    for error in &result.errors {
        println!("  - {error}");
    }
    Err(format!("verification failed with {} error(s)", result.errors.len()).into())
}

fn verify(engine: &Arc<StorageEngine>) -> Result<VerifyResult, CoreError> {
    let mut result = VerifyResult {
        entries_checked: engine.oplog().entries()?.len(),
        ..VerifyResult::default()
    };

    let truncated_before = engine.oplog().truncated_before();
    let catalog = SessionCatalog::new(Arc::clone(engine));
    let client = Client::new("verify");

    for record in engine.session_table().records() {
        result.sessions_checked += 1;
        let lsid = record.session_id;

        if engine.oplog().find(record.last_write_op_time)?.is_none() {
            let retained = truncated_before.map_or(true, |t| record.last_write_op_time >= t);
            if retained {
                result.errors.push(format!(
                    "session {lsid}: last write {} is missing from the oplog",
                    record.last_write_op_time
                ));
                continue;
            }
        }

        let session = catalog.get_or_create(lsid);
        let op = OperationContext::new(Arc::clone(&client), engine);
        match session.refresh_from_storage_if_needed(&op) {
            Ok(()) => {
                if session.has_incomplete_history() {
                    result.incomplete_histories += 1;
                }
            }
            Err(e) if e.is_unrecoverable() => return Err(e),
            Err(e) => result.errors.push(format!("session {lsid}: {e}")),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessiontxn_core::LogicalSessionId;

    #[test]
    fn empty_directory_verifies() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let result = verify(&engine).unwrap();
        assert!(result.is_ok());
        assert_eq!(result.sessions_checked, 0);
    }

    #[test]
    fn row_without_entry_is_reported() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let catalog = SessionCatalog::new(Arc::clone(&engine));
        let session = catalog.get_or_create(LogicalSessionId::new("v"));
        let mut op = OperationContext::new(Client::new("c"), &engine)
            .with_session(*session.session_id(), 1);
        session.refresh_from_storage_if_needed(&op).unwrap();
        session.begin_or_continue_txn(&op, 1, None).unwrap();

        let mut wuow = sessiontxn_core::WriteUnitOfWork::new(&mut op).unwrap();
        let op_time = engine.oplog().reserve_op_time();
        session
            .on_write_op_completed_on_primary(
                &mut wuow,
                1,
                vec![0],
                op_time,
                sessiontxn_core::WallClockTime::now(),
            )
            .unwrap();
        wuow.commit().unwrap();

        let result = verify(&engine).unwrap();
        assert_eq!(result.sessions_checked, 1);
        assert_eq!(result.errors.len(), 1);
    }
}
