//! Replaying a primary's oplog on another node.

mod common;

use common::{begin_retryable, in_memory_session, insert_entry, operation, write_statements};
use proptest::prelude::*;
use sessiontxn_core::{
    add_ops_for_replicating_txn_table, LogicalSessionId, OpTime, OplogEntry, SecondaryApplier,
    SessionCatalog, StorageEngine, WallClockTime, SESSION_TRANSACTIONS_NS,
};
use std::sync::Arc;

fn secondary() -> (Arc<StorageEngine>, Arc<SessionCatalog>, SecondaryApplier) {
    let engine = StorageEngine::open_in_memory().unwrap();
    let catalog = Arc::new(SessionCatalog::new(Arc::clone(&engine)));
    let applier = SecondaryApplier::new(Arc::clone(&engine), Arc::clone(&catalog));
    (engine, catalog, applier)
}

#[test]
fn secondary_rebuilds_session_history() {
    let (primary, session) = in_memory_session("alice");
    let mut op = operation(&session, 3);
    begin_retryable(&session, &op, 3);
    write_statements(&session, &mut op, 3, &[0, 1]).unwrap();
    let last = write_statements(&session, &mut op, 3, &[2]).unwrap();

    let (engine, catalog, applier) = secondary();
    let replica = catalog.get_or_create(*session.session_id());
    let replica_op = operation(&replica, 3);
    replica.refresh_from_storage_if_needed(&replica_op).unwrap();
    assert_eq!(replica.active_txn_number(), -1);

    let batch = primary.oplog().entries().unwrap();
    let applied = applier.apply_batch(&batch).unwrap();
    assert_eq!(applied.entries_written, 3);
    assert_eq!(applied.rows_changed, 1);
    assert_eq!(applied.sessions_invalidated, 1);

    assert_eq!(
        engine.session_table().find(session.session_id()),
        primary.session_table().find(session.session_id())
    );

    replica.refresh_from_storage_if_needed(&replica_op).unwrap();
    assert_eq!(replica.active_txn_number(), 3);
    assert_eq!(replica.get_last_write_op_time(3).unwrap(), last);
    assert!(replica
        .check_statement_executed(&replica_op, 3, 1)
        .unwrap()
        .is_some());
}

#[test]
fn derived_updates_are_not_logged() {
    let (engine, _catalog, applier) = secondary();
    let lsid = LogicalSessionId::new("bob");
    let entry = insert_entry(OpTime::new(1, 1), 0)
        .with_session(lsid, 1)
        .with_statement_id(0)
        .with_prev_write_op_time(OpTime::null())
        .with_wall_clock_time(WallClockTime::from_millis(5));
    applier.apply_batch(&[entry]).unwrap();

    let logged = engine.oplog().entries().unwrap();
    assert_eq!(logged.len(), 1);
    assert!(logged.iter().all(|e| e.ns != SESSION_TRANSACTIONS_NS));
}

#[test]
fn batch_split_applies_like_whole() {
    let (primary, session) = in_memory_session("carol");
    let mut op = operation(&session, 1);
    begin_retryable(&session, &op, 1);
    for stmt_id in 0..4 {
        write_statements(&session, &mut op, 1, &[stmt_id]).unwrap();
    }
    let batch = primary.oplog().entries().unwrap();

    let (whole, _, whole_applier) = secondary();
    whole_applier.apply_batch(&batch).unwrap();

    let (split, _, split_applier) = secondary();
    for chunk in batch.chunks(1) {
        split_applier.apply_batch(chunk).unwrap();
    }

    assert_eq!(
        whole.session_table().records(),
        split.session_table().records()
    );
    assert_eq!(whole.oplog().len(), split.oplog().len());
}

#[test]
fn rolled_back_write_is_not_executed_after_refresh() {
    let (primary, session) = in_memory_session("dave");
    let mut op = operation(&session, 2);
    begin_retryable(&session, &op, 2);
    let kept = write_statements(&session, &mut op, 2, &[0]).unwrap();
    write_statements(&session, &mut op, 2, &[1]).unwrap();

    let (engine, catalog, applier) = secondary();
    applier.apply_batch(&primary.oplog().entries().unwrap()).unwrap();
    let replica = catalog.get_or_create(*session.session_id());
    let replica_op = operation(&replica, 2);
    replica.refresh_from_storage_if_needed(&replica_op).unwrap();
    assert!(replica.check_statement_executed_no_oplog_entry_fetch(2, 1).unwrap());

    let outcome = applier.roll_back_to(kept).unwrap();
    assert_eq!(outcome.entries_removed, 1);
    assert_eq!(outcome.sessions_invalidated, 1);
    assert!(!replica.is_valid());

    replica.refresh_from_storage_if_needed(&replica_op).unwrap();
    assert!(replica.check_statement_executed_no_oplog_entry_fetch(2, 0).unwrap());
    assert!(replica
        .check_statement_executed(&replica_op, 2, 1)
        .unwrap()
        .is_none());
    assert_eq!(replica.get_last_write_op_time(2).unwrap(), kept);
    let row = engine.session_table().find(session.session_id()).unwrap();
    assert_eq!(row.last_write_op_time, kept);
}

fn chain(lsid: LogicalSessionId, txn_number: i64, count: u64) -> Vec<OplogEntry> {
    let mut prev = OpTime::null();
    (0..count)
        .map(|i| {
            let op_time = OpTime::new(i + 1, 1);
            let stmt_id = i32::try_from(i).unwrap();
            let entry = insert_entry(op_time, stmt_id)
                .with_session(lsid, txn_number)
                .with_statement_id(stmt_id)
                .with_prev_write_op_time(prev)
                .with_wall_clock_time(WallClockTime::from_millis(1_000 + i as i64));
            prev = op_time;
            entry
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn replaying_a_batch_is_idempotent(count in 1u64..12, txn_number in 0i64..100, replays in 1usize..4) {
        let lsid = LogicalSessionId::new("prop");
        let batch = chain(lsid, txn_number, count);
        let (engine, _catalog, applier) = secondary();

        applier.apply_batch(&batch).unwrap();
        let row = engine.session_table().find(&lsid);
        let logged = engine.oplog().len();
        prop_assert!(row.is_some());

        for _ in 0..replays {
            let again = applier.apply_batch(&batch).unwrap();
            prop_assert_eq!(again.entries_written, 0);
            prop_assert_eq!(again.rows_changed, 0);
        }
        prop_assert_eq!(engine.session_table().find(&lsid), row);
        prop_assert_eq!(engine.oplog().len(), logged);
    }

    #[test]
    fn replaying_an_older_batch_never_moves_the_row_back(
        (count, split) in (2u64..12).prop_flat_map(|count| (Just(count), 1..count))
    ) {
        let lsid = LogicalSessionId::new("prop");
        let batch = chain(lsid, 1, count);
        let split = usize::try_from(split).unwrap();
        let (older, newer) = batch.split_at(split);
        let (engine, _catalog, applier) = secondary();

        applier.apply_batch(older).unwrap();
        applier.apply_batch(newer).unwrap();
        let row = engine.session_table().find(&lsid);
        let replayed = applier.apply_batch(older).unwrap();

        prop_assert_eq!(replayed.rows_changed, 0);
        prop_assert_eq!(engine.session_table().find(&lsid), row);
        prop_assert_eq!(
            row.map(|r| r.last_write_op_time),
            Some(OpTime::new(count, 1))
        );
    }

    #[test]
    fn every_session_write_gets_one_update(count in 0u64..10) {
        let batch = chain(LogicalSessionId::new("x"), 1, count);
        let expanded = add_ops_for_replicating_txn_table(&batch).unwrap();
        prop_assert_eq!(expanded.len() as u64, count * 2);
        for pair in expanded.chunks(2) {
            prop_assert_eq!(pair[0].op_time, pair[1].op_time);
            prop_assert_eq!(pair[1].ns.as_str(), SESSION_TRANSACTIONS_NS);
        }
    }
}
