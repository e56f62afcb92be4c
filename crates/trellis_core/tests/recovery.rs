//! Crash recovery scenarios driven through the `Database` facade.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use trellis_codec::{encode_legacy_entry, FormatVersion, LogHeader};
use trellis_core::{
    CommittedTransaction, Config, CoreError, CoreResult, Database, GraphStore, LegacyLogMigrator,
    LogEntry, LogFiles, LogPosition, LogStore, MemoryLogStore, MemorySnapshot, RecoveryCriteria,
    RecoveryMonitor, RecoveryOutcome, RecoveryReport, SnapshotSlot, StorageEngine, NO_TOKEN,
};
use trellis_storage::{StorageBackend, StorageError, StorageResult};

struct Slots {
    primary: MemorySnapshot,
    counts: MemorySnapshot,
}

impl Slots {
    fn new() -> Self {
        Self {
            primary: MemorySnapshot::new(),
            counts: MemorySnapshot::new(),
        }
    }

    /// Engine sharing these slots.
    fn engine(&self) -> Arc<GraphStore> {
        Arc::new(
            GraphStore::with_slots(Box::new(self.primary.clone()), Box::new(self.counts.clone()))
                .unwrap(),
        )
    }

    /// Engine over what the slots hold right now, as a restarted process
    /// would see it.
    fn restarted_engine(&self) -> Arc<GraphStore> {
        Arc::new(
            GraphStore::with_slots(Box::new(self.primary.copy()), Box::new(self.counts.copy()))
                .unwrap(),
        )
    }
}

fn open(store: &MemoryLogStore, config: Config, engine: &Arc<GraphStore>) -> Database {
    Database::open_with_store(
        Arc::new(store.clone()),
        config,
        Arc::clone(engine) as Arc<dyn StorageEngine>,
        &trellis_core::LoggingMonitor,
    )
    .unwrap()
}

fn try_open(store: &MemoryLogStore, config: Config, engine: &Arc<GraphStore>) -> Result<Database, CoreError> {
    Database::open_with_store(
        Arc::new(store.clone()),
        config,
        Arc::clone(engine) as Arc<dyn StorageEngine>,
        &trellis_core::LoggingMonitor,
    )
}

fn no_close_checkpoint() -> Config {
    Config::default().checkpoint_on_close(false)
}

fn create_node(db: &Database, engine: &GraphStore, labels: &[u32]) -> u64 {
    let mut tx = engine.begin();
    tx.create_node(labels.iter().copied());
    db.commit(tx.into_commands().unwrap()).unwrap().id
}

#[derive(Default)]
struct CountingMonitor {
    recovered: AtomicU64,
    required: AtomicBool,
    not_needed: AtomicBool,
}

impl RecoveryMonitor for CountingMonitor {
    fn recovery_required(&self, _from: LogPosition) {
        self.required.store(true, Ordering::SeqCst);
    }

    fn transaction_recovered(&self, _tx: &CommittedTransaction) {
        self.recovered.fetch_add(1, Ordering::SeqCst);
    }

    fn recovery_completed(&self, _report: &RecoveryReport) {}

    fn no_recovery_needed(&self) {
        self.not_needed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn replay_matches_normal_apply() {
    let slots = Slots::new();
    let engine = slots.engine();
    let store = MemoryLogStore::new();
    let db = open(&store, no_close_checkpoint(), &engine);

    let a = create_node(&db, &engine, &[1]);
    db.checkpoint("before").unwrap();
    // The store as it was before the transactions below.
    let before = Slots {
        primary: slots.primary.copy(),
        counts: slots.counts.copy(),
    };

    let b = create_node(&db, &engine, &[2]);
    let mut tx = engine.begin();
    let rel = tx.create_relationship(a, 7, b).unwrap();
    tx.set_relationship_property(rel, "since", trellis_core::PropertyValue::Int(2020))
        .unwrap();
    db.commit(tx.into_commands().unwrap()).unwrap();
    let mut tx = engine.begin();
    tx.set_node_property(a, "name", trellis_core::PropertyValue::Text("a".into()))
        .unwrap();
    db.commit(tx.into_commands().unwrap()).unwrap();

    let expected = engine.encoded_state().unwrap();
    let crashed = store.crash_copy();
    drop(db);

    let replayed = before.restarted_engine();
    let db = open(&crashed, no_close_checkpoint(), &replayed);
    assert_eq!(db.recovery_report().replayed_transactions, 3);
    assert_eq!(replayed.encoded_state().unwrap(), expected);
}

#[test]
fn checkpoint_is_idempotent_and_monotonic() {
    let engine = Arc::new(GraphStore::in_memory());
    let store = MemoryLogStore::new();
    let db = open(&store, no_close_checkpoint(), &engine);

    create_node(&db, &engine, &[1]);
    let first = db.checkpoint("one").unwrap();
    let same = db.checkpoint("two").unwrap();
    assert_eq!(first, same);

    create_node(&db, &engine, &[1]);
    let later = db.checkpoint("three").unwrap();
    assert!(later > first);
}

#[test]
fn crash_at_every_byte_recovers_whole_transactions() {
    let writer = Arc::new(GraphStore::in_memory());
    let store = MemoryLogStore::new();
    let db = open(&store, no_close_checkpoint(), &writer);
    let mut commit_ends = Vec::new();
    for label in 0..4 {
        create_node(&db, &writer, &[label]);
        commit_ends.push(db.log_files().current_position().byte_offset);
    }
    drop(db);
    let full = store.file_bytes(0).unwrap();

    for cut in LogHeader::current(0, 0).encode().len()..=full.len() {
        let crashed = MemoryLogStore::new();
        crashed.insert(0, full[..cut].to_vec());
        let engine = Arc::new(GraphStore::in_memory());
        let db = open(&crashed, no_close_checkpoint(), &engine);

        let expected = commit_ends.iter().filter(|end| **end <= cut as u64).count();
        assert_eq!(
            db.last_committed_transaction_id(),
            expected as u64,
            "cut at byte {cut}"
        );
        assert_eq!(engine.node_count(), expected, "cut at byte {cut}");
        assert_eq!(
            engine.counts_snapshot().node_count(NO_TOKEN),
            expected as i64,
            "cut at byte {cut}"
        );

        // The appender resumes right after the last whole transaction.
        let next = create_node(&db, &engine, &[9]);
        assert_eq!(next, expected as u64 + 1);
    }
}

#[test]
fn counts_are_merged_not_overwritten() {
    const A: u32 = 1;
    const B: u32 = 2;

    let slots = Slots::new();
    let engine = slots.engine();
    let store = MemoryLogStore::new();
    let db = open(&store, no_close_checkpoint(), &engine);

    create_node(&db, &engine, &[A]);
    db.checkpoint("after A").unwrap();
    create_node(&db, &engine, &[B]);
    // Records reach disk, counts do not.
    engine.flush_primary().unwrap();
    let crashed = store.crash_copy();
    drop(db);

    let restarted = slots.restarted_engine();
    assert_eq!(restarted.last_applied_transaction_id(), 2);
    assert_eq!(restarted.counts_state().tx_id, 1);

    let db = open(&crashed, no_close_checkpoint(), &restarted);
    assert_eq!(db.recovery_report().outcome, RecoveryOutcome::Recovered);
    let counts = restarted.counts_snapshot();
    assert_eq!(counts.node_count(A), 1);
    assert_eq!(counts.node_count(B), 1);
    assert_eq!(counts.node_count(NO_TOKEN), 2);
}

#[test]
fn damaged_counts_are_rebuilt() {
    let slots = Slots::new();
    let engine = slots.engine();
    let store = MemoryLogStore::new();
    let db = open(&store, Config::default(), &engine);
    create_node(&db, &engine, &[3]);
    create_node(&db, &engine, &[3]);
    db.close().unwrap();

    let mut damaged = slots.counts.load().unwrap().unwrap();
    let middle = damaged.len() / 2;
    damaged[middle] ^= 0xff;
    slots.counts.set_raw(Some(damaged));

    let restarted = slots.restarted_engine();
    assert!(!restarted.counts_state().consistent);
    let db = open(&store.crash_copy(), Config::default(), &restarted);
    assert_eq!(
        db.recovery_report().counts,
        Some(trellis_core::recovery::CountsOutcome::Rebuilt)
    );
    assert_eq!(restarted.counts_snapshot().node_count(3), 2);
    assert!(restarted.counts_state().consistent);
}

#[test]
fn clean_shutdown_replays_nothing() {
    let slots = Slots::new();
    let engine = slots.engine();
    let store = MemoryLogStore::new();
    let db = open(&store, Config::default(), &engine);
    for _ in 0..3 {
        create_node(&db, &engine, &[1]);
    }
    db.close().unwrap();
    drop(db);

    let monitor = CountingMonitor::default();
    let restarted = slots.restarted_engine();
    let db = Database::open_with_store(
        Arc::new(store.crash_copy()),
        Config::default(),
        Arc::clone(&restarted) as Arc<dyn StorageEngine>,
        &monitor,
    )
    .unwrap();

    assert_eq!(monitor.recovered.load(Ordering::SeqCst), 0);
    assert!(!monitor.required.load(Ordering::SeqCst));
    assert!(monitor.not_needed.load(Ordering::SeqCst));
    assert_eq!(db.recovery_report().outcome, RecoveryOutcome::NotNeeded);
    assert_eq!(db.last_committed_transaction_id(), 3);
    assert_eq!(restarted.node_count(), 3);
}

#[test]
fn out_of_order_append_writes_nothing() {
    let engine = Arc::new(GraphStore::in_memory());
    let store = MemoryLogStore::new();
    let db = open(&store, no_close_checkpoint(), &engine);
    create_node(&db, &engine, &[1]);
    let before = store.file_bytes(0).unwrap();

    let appender = trellis_core::TransactionAppender::new(
        Arc::clone(db.log_files()),
        db.last_committed_transaction_id(),
        std::time::Duration::ZERO,
    );
    let tx = trellis_core::TransactionRepresentation::new(vec![vec![1]]).with_tx_id(3);
    let err = appender.append(&tx).unwrap_err();
    assert!(matches!(
        err,
        CoreError::OutOfOrderTransaction {
            expected: 2,
            actual: 3
        }
    ));
    assert_eq!(store.file_bytes(0).unwrap(), before);
}

#[test]
fn group_commit_batches_flushes() {
    const THREADS: usize = 8;
    let engine = Arc::new(GraphStore::in_memory());
    let store = MemoryLogStore::new();
    let config = no_close_checkpoint().group_commit_window(std::time::Duration::from_millis(20));
    let db = Arc::new(open(&store, config, &engine));
    let barrier = Arc::new(std::sync::Barrier::new(THREADS));

    let flushes_before = db.log_force_count();
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let db = Arc::clone(&db);
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                create_node(&db, &engine, &[1])
            })
        })
        .collect();
    let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ids.sort_unstable();

    assert_eq!(ids, (1..=THREADS as u64).collect::<Vec<_>>());
    assert!(db.log_force_count() - flushes_before < THREADS as u64);
    assert_eq!(engine.node_count(), THREADS);
}

/// Writes `transactions` node creations and returns a durable copy of the log.
fn log_of(transactions: usize) -> MemoryLogStore {
    let engine = Arc::new(GraphStore::in_memory());
    let store = MemoryLogStore::new();
    let db = open(&store, no_close_checkpoint(), &engine);
    for _ in 0..transactions {
        create_node(&db, &engine, &[1]);
    }
    drop(db);
    store.crash_copy()
}

#[test]
fn bad_commit_crc_is_fatal() {
    let store = log_of(3);
    let mut bytes = store.file_bytes(0).unwrap();
    // Inside the payload of the last commit entry; its length is intact.
    let index = bytes.len() - 6;
    bytes[index] ^= 0x01;
    store.insert(0, bytes);

    let engine = Arc::new(GraphStore::in_memory());
    let err = try_open(&store, Config::default(), &engine).unwrap_err();
    match err {
        CoreError::RecoveryFailed { source, .. } => {
            assert!(matches!(*source, CoreError::ChecksumMismatch { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn tolerated_corruption_is_truncated() {
    let store = log_of(3);
    let mut bytes = store.file_bytes(0).unwrap();
    let index = bytes.len() - 6;
    bytes[index] ^= 0x01;
    store.insert(0, bytes.clone());

    let engine = Arc::new(GraphStore::in_memory());
    let db = open(&store, no_close_checkpoint().fail_on_corrupted_log(false), &engine);
    let report = db.recovery_report();
    assert!(report.corruption.is_some());
    assert!(report.truncated_at.is_some());
    assert_eq!(db.last_committed_transaction_id(), 2);
    assert_eq!(engine.node_count(), 2);

    // The damaged transaction is gone; new commits continue after it.
    assert_eq!(create_node(&db, &engine, &[1]), 3);
    drop(db);
    let reopened = Arc::new(GraphStore::in_memory());
    let db = open(&store.crash_copy(), no_close_checkpoint(), &reopened);
    assert_eq!(db.last_committed_transaction_id(), 3);
    assert_eq!(reopened.node_count(), 3);
}

#[test]
fn criteria_stop_recovery_early() {
    let store = log_of(5);
    let engine = Arc::new(GraphStore::in_memory());
    let config =
        no_close_checkpoint().recovery_criteria(RecoveryCriteria::UntilTransaction(3));
    let db = open(&store, config, &engine);

    assert!(db.recovery_report().stopped_by_criteria);
    assert_eq!(db.last_committed_transaction_id(), 2);
    assert_eq!(engine.node_count(), 2);

    // Transactions 3..5 can never come back.
    drop(db);
    let later = Arc::new(GraphStore::in_memory());
    let db = open(&store.crash_copy(), no_close_checkpoint(), &later);
    assert_eq!(db.last_committed_transaction_id(), 2);
    assert_eq!(later.node_count(), 2);
}

#[test]
fn missing_logs_are_reported() {
    let slots = Slots::new();
    let engine = slots.engine();
    let store = MemoryLogStore::new();
    let db = open(&store, Config::default(), &engine);
    create_node(&db, &engine, &[1]);
    db.close().unwrap();
    drop(db);

    let empty = MemoryLogStore::new();
    let restarted = slots.restarted_engine();
    let err = try_open(&empty, Config::default(), &restarted).unwrap_err();
    assert!(matches!(
        err,
        CoreError::MissingLogs {
            last_applied_tx_id: 1
        }
    ));

    let db = open(&empty, Config::default().fail_on_missing_logs(false), &restarted);
    assert_eq!(create_node(&db, &restarted, &[1]), 2);
}

fn legacy_log(writer: &GraphStore) -> MemoryLogStore {
    let mut first = writer.begin();
    first.create_node([1]);
    let first = first.into_commands().unwrap();
    let mut second = writer.begin();
    second.create_node([2]);
    let second = second.into_commands().unwrap();

    let start = |tx_id: u64| LogEntry::Start {
        tx_id,
        last_committed_tx_id: 0,
        timestamp: 1_000 + tx_id,
        leader_term: 0,
        additional_data: Vec::new(),
    };
    let commit = |tx_id: u64| LogEntry::Commit {
        tx_id,
        timestamp: 2_000 + tx_id,
        checksum: 0,
    };

    // Transaction 2's writer started first but committed last.
    let mut entries = vec![(8, start(2)), (5, start(1))];
    for payload in &second {
        entries.push((8, LogEntry::Command { payload: payload.clone() }));
    }
    for payload in &first {
        entries.push((5, LogEntry::Command { payload: payload.clone() }));
    }
    entries.push((5, commit(1)));
    entries.push((8, commit(2)));

    let mut bytes = LogHeader {
        format_version: FormatVersion::Legacy,
        log_version: 0,
        last_committed_tx_id: 0,
    }
    .encode();
    for (identifier, entry) in &entries {
        encode_legacy_entry(entry, *identifier, &mut bytes).unwrap();
    }
    let store = MemoryLogStore::new();
    store.insert(0, bytes);
    store
}

#[test]
fn migrated_log_recovers_like_the_legacy_one() {
    let scratch = GraphStore::in_memory();
    let legacy = legacy_log(&scratch);
    let migrated = legacy.crash_copy();

    let from_legacy = Arc::new(GraphStore::in_memory());
    let db = open(&legacy, no_close_checkpoint(), &from_legacy);
    assert_eq!(db.recovery_report().replayed_transactions, 2);
    drop(db);

    let report = LegacyLogMigrator::new(Arc::new(migrated.clone())).migrate().unwrap();
    assert_eq!(report.migrated_versions, vec![0]);
    let files = LogFiles::new(Arc::new(migrated.clone()), 1 << 20, 4096);
    assert_eq!(
        files.read_header(0).unwrap().unwrap().format_version,
        FormatVersion::Current
    );

    let from_migrated = Arc::new(GraphStore::in_memory());
    let db = open(&migrated, no_close_checkpoint(), &from_migrated);
    assert_eq!(db.recovery_report().replayed_transactions, 2);
    assert_eq!(
        from_migrated.encoded_state().unwrap(),
        from_legacy.encoded_state().unwrap()
    );
}

/// Backend whose reads past the header fail.
struct UnreadableBackend {
    inner: Box<dyn StorageBackend>,
}

impl StorageBackend for UnreadableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if offset >= 25 {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk read error",
            )));
        }
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// Log store with one version whose entries cannot be read.
#[derive(Debug)]
struct UnreadableVersion {
    inner: MemoryLogStore,
    version: u64,
}

impl LogStore for UnreadableVersion {
    fn versions(&self) -> CoreResult<Vec<u64>> {
        self.inner.versions()
    }

    fn open(&self, version: u64) -> CoreResult<Box<dyn StorageBackend>> {
        let backend = self.inner.open(version)?;
        if version == self.version {
            return Ok(Box::new(UnreadableBackend { inner: backend }));
        }
        Ok(backend)
    }

    fn remove(&self, version: u64) -> CoreResult<()> {
        self.inner.remove(version)
    }

    fn replace(&self, version: u64, contents: &[u8]) -> CoreResult<()> {
        self.inner.replace(version, contents)
    }

    fn describe(&self, version: u64) -> String {
        self.inner.describe(version)
    }
}

#[test]
fn read_failure_names_the_version_and_last_confirmed_transaction() {
    let store = MemoryLogStore::new();
    let engine = Arc::new(GraphStore::in_memory());
    let db = open(&store, no_close_checkpoint().max_log_size(200), &engine);
    for _ in 0..6 {
        // Large enough that every transaction fills its own version.
        let mut tx = engine.begin();
        for label in 0..8 {
            tx.create_node([label, label + 1, label + 2]);
        }
        db.commit(tx.into_commands().unwrap()).unwrap();
    }
    drop(db);
    let image = store.crash_copy();
    assert!(image.file_bytes(3).unwrap().len() > 25);

    let files = LogFiles::new(Arc::new(image.clone()), 1 << 20, 4096);
    let mut committed_before = 0;
    for version in 0..3 {
        for entry in files.open_version_cursor(version).unwrap() {
            if let LogEntry::Commit { tx_id, .. } = entry.unwrap().entry {
                committed_before = tx_id;
            }
        }
    }
    assert!(committed_before > 0);

    let failing = UnreadableVersion {
        inner: image,
        version: 3,
    };
    let err = Database::open_with_store(
        Arc::new(failing),
        no_close_checkpoint().max_log_size(200),
        Arc::new(GraphStore::in_memory()) as Arc<dyn StorageEngine>,
        &trellis_core::LoggingMonitor,
    )
    .unwrap_err();
    match err {
        CoreError::RecoveryFailed {
            position,
            last_tx_id,
            source,
        } => {
            assert_eq!(position, LogPosition::new(3, 25));
            assert_eq!(last_tx_id, committed_before);
            assert!(matches!(*source, CoreError::LogRead { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}
