//! Retryable writes end to end: dedup, restart, truncated history.

mod common;

use common::{
    begin_retryable, in_memory_session, insert_entry, operation, write_statements, FailingBackend,
};
use sessiontxn_core::{
    Config, CoreError, LogicalSessionId, OpTime, SecondaryApplier, Session, SessionCatalog,
    SingleWriteResult, StorageEngine, WallClockTime,
};
use sessiontxn_storage::{InMemoryBackend, StorageBackend};
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn executed_statement_is_found_and_missing_one_is_not() {
    let (engine, session) = in_memory_session("alice");
    let mut op = operation(&session, 5);
    begin_retryable(&session, &op, 5);

    let p1 = write_statements(&session, &mut op, 5, &[0]).unwrap();

    let entry = session.check_statement_executed(&op, 5, 0).unwrap().unwrap();
    assert_eq!(entry.op_time, p1);
    assert_eq!(entry.statement_id, Some(0));
    assert!(session.check_statement_executed(&op, 5, 1).unwrap().is_none());

    let reply = SingleWriteResult::for_insert(&entry).unwrap();
    assert_eq!(reply.n, 1);
    assert_eq!(engine.stats().retried_statements(), 1);
}

#[test]
fn statements_chain_across_writes() {
    let (engine, session) = in_memory_session("bob");
    let mut op = operation(&session, 2);
    begin_retryable(&session, &op, 2);

    let first = write_statements(&session, &mut op, 2, &[0, 1]).unwrap();
    let last = write_statements(&session, &mut op, 2, &[2]).unwrap();
    assert!(first < last);

    let chain: Vec<_> = engine
        .oplog()
        .history(last)
        .map(|entry| entry.unwrap().statement_id.unwrap())
        .collect();
    assert_eq!(chain, [2, 1, 0]);

    let row = engine.session_table().find(session.session_id()).unwrap();
    assert_eq!(row.txn_num, 2);
    assert_eq!(row.last_write_op_time, last);
    assert_eq!(engine.stats().transactions_collection_writes(), 2);
}

#[test]
fn newer_transaction_forgets_older_statements() {
    let (_engine, session) = in_memory_session("carol");
    let mut op = operation(&session, 1);
    begin_retryable(&session, &op, 1);
    write_statements(&session, &mut op, 1, &[0]).unwrap();

    let mut next = operation(&session, 2);
    session.begin_or_continue_txn(&next, 2, None).unwrap();
    assert!(!session.check_statement_executed_no_oplog_entry_fetch(2, 0).unwrap());
    write_statements(&session, &mut next, 2, &[0]).unwrap();

    let err = session.check_statement_executed(&op, 1, 0).unwrap_err();
    assert!(matches!(err, CoreError::TransactionNotActive { requested: 1, active: 2, .. }));
}

#[test]
fn history_survives_restart() {
    let dir = tempdir().unwrap();
    let lsid = LogicalSessionId::new("dave");
    let last = {
        let engine = StorageEngine::open(dir.path()).unwrap();
        let catalog = SessionCatalog::new(Arc::clone(&engine));
        let session = catalog.get_or_create(lsid);
        let mut op = operation(&session, 9);
        begin_retryable(&session, &op, 9);
        write_statements(&session, &mut op, 9, &[0, 1]).unwrap();
        write_statements(&session, &mut op, 9, &[2]).unwrap()
    };

    let engine = StorageEngine::open(dir.path()).unwrap();
    let catalog = SessionCatalog::new(Arc::clone(&engine));
    let session = catalog.get_or_create(lsid);
    let op = operation(&session, 9);
    session.refresh_from_storage_if_needed(&op).unwrap();

    assert_eq!(session.active_txn_number(), 9);
    assert_eq!(session.get_last_write_op_time(9).unwrap(), last);
    for stmt_id in 0..3 {
        assert!(session.check_statement_executed_no_oplog_entry_fetch(9, stmt_id).unwrap());
    }
    assert!(!session.has_incomplete_history());

    let err = session.begin_or_continue_txn(&op, 8, None).unwrap_err();
    assert!(matches!(err, CoreError::StaleTransaction { .. }));
}

#[test]
fn second_open_of_data_dir_is_refused() {
    let dir = tempdir().unwrap();
    let _engine = StorageEngine::open(dir.path()).unwrap();
    assert!(matches!(
        StorageEngine::open(dir.path()),
        Err(CoreError::DataDirLocked)
    ));
}

#[test]
fn truncated_history_is_reported_as_incomplete() {
    let (engine, session) = in_memory_session("erin");
    let mut op = operation(&session, 3);
    begin_retryable(&session, &op, 3);
    write_statements(&session, &mut op, 3, &[0]).unwrap();
    write_statements(&session, &mut op, 3, &[1]).unwrap();
    let newest = write_statements(&session, &mut op, 3, &[2]).unwrap();

    assert_eq!(engine.oplog().truncate_before(newest).unwrap(), 2);
    session.invalidate();
    session.refresh_from_storage_if_needed(&op).unwrap();

    assert!(session.has_incomplete_history());
    assert!(session.check_statement_executed_no_oplog_entry_fetch(3, 2).unwrap());
    let err = session
        .check_statement_executed_no_oplog_entry_fetch(3, 0)
        .unwrap_err();
    assert!(matches!(err, CoreError::IncompleteHistory { .. }));
    assert!(!err.is_unrecoverable());
}

#[test]
fn statement_recorded_twice_in_history_is_fatal() {
    let engine = StorageEngine::open_in_memory().unwrap();
    let catalog = Arc::new(SessionCatalog::new(Arc::clone(&engine)));
    let applier = SecondaryApplier::new(Arc::clone(&engine), Arc::clone(&catalog));
    let lsid = LogicalSessionId::new("frank");
    let wall = WallClockTime::from_millis(77);

    let first = insert_entry(OpTime::new(10, 1), 0)
        .with_session(lsid, 4)
        .with_statement_id(0)
        .with_prev_write_op_time(OpTime::null())
        .with_wall_clock_time(wall);
    let second = insert_entry(OpTime::new(11, 1), 0)
        .with_session(lsid, 4)
        .with_statement_id(0)
        .with_prev_write_op_time(first.op_time)
        .with_wall_clock_time(wall);
    applier.apply_batch(&[first, second]).unwrap();

    let session = catalog.get_or_create(lsid);
    let op = operation(&session, 4);
    let err = session.refresh_from_storage_if_needed(&op).unwrap_err();
    assert!(err.is_unrecoverable());
    let CoreError::DuplicateStatement {
        stmt_id,
        txn_number,
        first,
        second,
        ..
    } = err
    else {
        panic!("expected a duplicate statement error, got {err}");
    };
    assert_eq!((stmt_id, txn_number), (0, 4));
    // The newer position is met first walking back from the row.
    assert_eq!(first, OpTime::new(11, 1));
    assert_eq!(second, OpTime::new(10, 1));
    assert!(!session.is_valid());
}

#[test]
fn interrupted_refresh_leaves_session_invalid() {
    let (_engine, session) = in_memory_session("grace");
    let op = operation(&session, 1);
    op.kill_handle().kill();
    assert!(matches!(
        session.refresh_from_storage_if_needed(&op),
        Err(CoreError::Interrupted)
    ));
    assert!(!session.is_valid());
}

fn engine_over(
    oplog: impl StorageBackend + 'static,
    table: impl StorageBackend + 'static,
) -> Arc<StorageEngine> {
    StorageEngine::open_with_backends(Config::default(), Box::new(oplog), Box::new(table)).unwrap()
}

fn session_on(engine: &Arc<StorageEngine>, user: &str) -> Arc<Session> {
    SessionCatalog::new(Arc::clone(engine)).get_or_create(LogicalSessionId::new(user))
}

#[test]
fn failed_table_write_leaves_no_oplog_entry() {
    let oplog = InMemoryBackend::new();
    let table = FailingBackend::new(InMemoryBackend::new());
    let engine = engine_over(oplog.clone(), table.clone());
    let session = session_on(&engine, "heidi");
    let mut op = operation(&session, 1);
    begin_retryable(&session, &op, 1);

    table.fail_after(0);
    let err = write_statements(&session, &mut op, 1, &[0]).unwrap_err();
    assert!(err.to_string().contains("disk full"));
    assert!(engine.oplog().is_empty());
    assert!(engine.session_table().is_empty());
    let op = operation(&session, 1);
    assert!(session.check_statement_executed(&op, 1, 0).unwrap().is_none());

    table.heal();
    drop((session, engine));
    let engine = engine_over(oplog, table);
    assert!(engine.oplog().is_empty());
    assert!(engine.session_table().is_empty());

    let session = session_on(&engine, "heidi");
    let mut op = operation(&session, 1);
    begin_retryable(&session, &op, 1);
    let written = write_statements(&session, &mut op, 1, &[0]).unwrap();
    assert_eq!(engine.oplog().len(), 1);
    let entry = session.check_statement_executed(&op, 1, 0).unwrap().unwrap();
    assert_eq!(entry.op_time, written);
}

#[test]
fn failed_commit_marker_drops_table_row_on_restart() {
    let oplog = FailingBackend::new(InMemoryBackend::new());
    let table = InMemoryBackend::new();
    let engine = engine_over(oplog.clone(), table.clone());
    let session = session_on(&engine, "ivan");
    let mut op = operation(&session, 1);
    begin_retryable(&session, &op, 1);

    // BEGIN and the entry go through; the COMMIT record does not.
    oplog.fail_after(2);
    assert!(write_statements(&session, &mut op, 1, &[0]).is_err());
    assert!(engine.oplog().is_empty());
    assert!(engine.session_table().is_empty());

    oplog.heal();
    let mut op = operation(&session, 1);
    write_statements(&session, &mut op, 1, &[0]).unwrap();
    assert_eq!(engine.oplog().len(), 1);

    drop((session, engine));
    let engine = engine_over(oplog, table);
    assert_eq!(engine.oplog().len(), 1);
    assert_eq!(engine.session_table().len(), 1);
    let session = session_on(&engine, "ivan");
    let op = operation(&session, 1);
    session.refresh_from_storage_if_needed(&op).unwrap();
    assert!(session.check_statement_executed_no_oplog_entry_fetch(1, 0).unwrap());
}
