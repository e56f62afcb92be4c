//! Crash recovery tests driven by the crash harness.

use trellis_core::{Config, StorageEngine, NO_TOKEN};
use trellis_testkit::prelude::*;

#[test]
fn committed_data_survives_a_crash() {
    let mut harness = CrashRecoveryHarness::new(8);
    let result = harness.test_committed_data_survives();
    assert!(result.passed, "{:?}", result.error);
}

#[test]
fn failed_checkpoint_loses_nothing() {
    let mut harness = CrashRecoveryHarness::new(5);
    let result = harness.test_crash_during_checkpoint();
    assert!(result.passed, "{:?}", result.error);
}

#[test]
fn crash_at_any_write_position_keeps_committed_transactions() {
    let mut harness = CrashRecoveryHarness::new(4);
    let result = harness.test_crash_sweep(3);
    assert!(result.passed, "{:?}", result.error);
    assert!(harness.all_passed());
}

#[test]
fn second_crash_after_recovery() {
    let db = TestDatabase::memory_with(Config::default().checkpoint_on_close(false));
    for label in 0..3 {
        db.create_node(&[label]);
    }
    let first = db.crash_image();
    drop(db);

    let recovered = first
        .open(Config::default().checkpoint_on_close(false))
        .unwrap();
    assert_eq!(recovered.last_committed_transaction_id(), 3);
    recovered.create_node(&[7]);
    let second = recovered.crash_image();
    drop(recovered);

    let again = second
        .open(Config::default().checkpoint_on_close(false))
        .unwrap();
    assert_eq!(again.last_committed_transaction_id(), 4);
    assert_eq!(again.engine.node_count(), 4);
    assert_eq!(again.engine.counts_snapshot().node_count(NO_TOKEN), 4);
    assert_eq!(again.engine.counts_snapshot().node_count(7), 1);
}

#[test]
fn file_database_reopens_with_its_data() {
    with_file_db(|db, _path| {
        db.create_node(&[1]);
        db.create_node(&[2]);
        assert_eq!(db.last_committed_transaction_id(), 2);
    });

    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("reopen.trellis");
    {
        let (db, engine) = open_file_database(&path, Config::default()).unwrap();
        let mut tx = engine.begin();
        tx.create_node([3]);
        db.commit(tx.into_commands().unwrap()).unwrap();
        db.close().unwrap();
    }

    let (db, engine) = open_file_database(&path, Config::default()).unwrap();
    assert_eq!(db.last_committed_transaction_id(), 1);
    assert_eq!(db.recovery_report().replayed_transactions, 0);
    assert_eq!(engine.node_count(), 1);
}
