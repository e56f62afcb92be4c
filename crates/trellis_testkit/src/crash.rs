//! Crash recovery testing for Trellis.
//!
//! This module provides utilities for testing crash recovery behavior.
//! It simulates crashes at various points during commits and checkpoints
//! and verifies that the database recovers exactly the transactions that
//! were reported committed.
//!
//! ## Test Strategy
//!
//! 1. **Crash during log write** - The write budget runs out mid-frame
//! 2. **Crash before flush** - Unflushed bytes are lost
//! 3. **Crash during checkpoint** - The checkpoint entry is never forced
//! 4. **Crash at every byte** - A sweep over write budgets
//!
//! ## Usage
//!
//! ```rust,ignore
//! use trellis_testkit::crash::CrashRecoveryHarness;
//!
//! let mut harness = CrashRecoveryHarness::new(4);
//! assert!(harness.test_crash_sweep(1).passed);
//! ```

use crate::fixtures::{MemoryFiles, TestDatabase};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use trellis_core::{Config, CoreError, CoreResult, LogStore, MemoryLogStore, StorageEngine, NO_TOKEN};
use trellis_storage::{StorageBackend, StorageError, StorageResult};

/// Write limits shared by every backend opened from one store.
#[derive(Debug)]
pub struct CrashControl {
    remaining_bytes: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
}

impl CrashControl {
    /// Creates a control with no limit.
    pub fn new() -> Self {
        Self {
            remaining_bytes: AtomicU64::new(u64::MAX),
            bytes_written: AtomicU64::new(0),
            crashed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
        }
    }

    /// Lets `bytes` more bytes through, then crashes.
    pub fn crash_after(&self, bytes: u64) {
        self.remaining_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether flush should fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Resets the crash state.
    pub fn reset(&self) {
        self.remaining_bytes.store(u64::MAX, Ordering::SeqCst);
        self.bytes_written.store(0, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
        self.fail_on_flush.store(false, Ordering::SeqCst);
    }

    /// Returns whether a crash has been simulated.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Bytes appended through backends of this control.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::SeqCst)
    }

    /// Takes up to `len` bytes from the budget and returns how many may be
    /// written.
    fn take(&self, len: u64) -> u64 {
        let mut granted = 0;
        let _ = self
            .remaining_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                granted = remaining.min(len);
                Some(remaining - granted)
            });
        granted
    }
}

impl Default for CrashControl {
    fn default() -> Self {
        Self::new()
    }
}

fn simulated(message: &str) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::Other, message.to_string()))
}

/// A storage backend wrapper that can simulate crashes.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    control: Arc<CrashControl>,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend.
    pub fn new(inner: Box<dyn StorageBackend>, control: Arc<CrashControl>) -> Self {
        Self { inner, control }
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        if self.control.has_crashed() {
            return Err(simulated("simulated crash: storage is gone"));
        }
        let granted = self.control.take(bytes.len() as u64) as usize;
        if granted < bytes.len() {
            self.control.crashed.store(true, Ordering::SeqCst);
            // Write partial data up to the crash point
            if granted > 0 {
                let _ = self.inner.append(&bytes[..granted]);
                self.control
                    .bytes_written
                    .fetch_add(granted as u64, Ordering::SeqCst);
            }
            return Err(simulated("simulated crash during partial write"));
        }
        let offset = self.inner.append(bytes)?;
        self.control
            .bytes_written
            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.control.has_crashed() || self.control.fail_on_flush.load(Ordering::SeqCst) {
            self.control.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated crash during flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.control.has_crashed() || self.control.fail_on_flush.load(Ordering::SeqCst) {
            self.control.crashed.store(true, Ordering::SeqCst);
            return Err(simulated("simulated crash during sync"));
        }
        self.inner.sync()
    }
}

/// A log store whose files share one [`CrashControl`].
#[derive(Debug, Clone)]
pub struct CrashableLogStore {
    inner: MemoryLogStore,
    control: Arc<CrashControl>,
}

impl CrashableLogStore {
    /// Wraps `inner`.
    pub fn new(inner: MemoryLogStore) -> Self {
        Self {
            inner,
            control: Arc::new(CrashControl::new()),
        }
    }

    /// The shared crash control.
    pub fn control(&self) -> &Arc<CrashControl> {
        &self.control
    }

    /// Every byte that reached the files, torn writes included, as durable
    /// files of a new store.
    ///
    /// This is the harshest crash image: the tail holds whatever part of the
    /// last write made it out.
    pub fn written_image(&self) -> MemoryLogStore {
        let image = MemoryLogStore::new();
        for version in self.inner.versions().unwrap_or_default() {
            if let Some(bytes) = self.inner.file_bytes(version) {
                image.insert(version, bytes);
            }
        }
        image
    }
}

impl LogStore for CrashableLogStore {
    fn versions(&self) -> CoreResult<Vec<u64>> {
        self.inner.versions()
    }

    fn open(&self, version: u64) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(Box::new(CrashableBackend::new(
            self.inner.open(version)?,
            Arc::clone(&self.control),
        )))
    }

    fn remove(&self, version: u64) -> CoreResult<()> {
        if self.control.has_crashed() {
            return Err(CoreError::Storage(simulated("simulated crash: storage is gone")));
        }
        self.inner.remove(version)
    }

    fn replace(&self, version: u64, contents: &[u8]) -> CoreResult<()> {
        if self.control.has_crashed() {
            return Err(CoreError::Storage(simulated("simulated crash: storage is gone")));
        }
        self.inner.replace(version, contents)
    }

    fn describe(&self, version: u64) -> String {
        format!("crashable:{}", self.inner.describe(version))
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Transactions expected after recovery.
    pub expected_transactions: u64,
    /// Transactions found after recovery.
    pub actual_transactions: u64,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, transactions: u64) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_transactions: transactions,
            actual_transactions: transactions,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: u64, actual: u64, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_transactions: expected,
            actual_transactions: actual,
            error: Some(error.to_string()),
        }
    }
}

/// State of a database after restarting on a crash image.
struct Restarted {
    last_committed: u64,
    nodes: u64,
    counted_nodes: i64,
}

fn restart(files: &MemoryFiles) -> CoreResult<Restarted> {
    let db = files.open(Config::default().checkpoint_on_close(false))?;
    Ok(Restarted {
        last_committed: db.last_committed_transaction_id(),
        nodes: db.engine.node_count() as u64,
        counted_nodes: db.engine.counts_snapshot().node_count(NO_TOKEN),
    })
}

fn check(description: &str, expected: u64, files: &MemoryFiles) -> CrashRecoveryResult {
    match restart(files) {
        Ok(state) if state.last_committed != expected => CrashRecoveryResult::fail(
            description,
            expected,
            state.last_committed,
            "wrong last committed transaction after recovery",
        ),
        Ok(state) if state.nodes != expected || state.counted_nodes != expected as i64 => {
            CrashRecoveryResult::fail(
                description,
                expected,
                state.nodes,
                &format!(
                    "store holds {} nodes, counts say {}",
                    state.nodes, state.counted_nodes
                ),
            )
        }
        Ok(_) => CrashRecoveryResult::pass(description, expected),
        Err(err) => CrashRecoveryResult::fail(description, expected, 0, &err.to_string()),
    }
}

/// Test harness for crash recovery scenarios.
///
/// Every workload commits one node per transaction, so after recovery the
/// store must hold exactly as many nodes as transactions were committed.
pub struct CrashRecoveryHarness {
    /// Transactions each workload commits.
    pub transactions: u64,
    /// Results of crash recovery tests.
    pub results: Vec<CrashRecoveryResult>,
}

impl CrashRecoveryHarness {
    /// Creates a harness whose workloads commit `transactions` transactions.
    pub fn new(transactions: u64) -> Self {
        Self {
            transactions,
            results: Vec::new(),
        }
    }

    fn record(&mut self, result: CrashRecoveryResult) -> CrashRecoveryResult {
        self.results.push(result.clone());
        result
    }

    /// Opens a database over a crashable log with fresh store slots.
    fn open_crashable(&self) -> CoreResult<(TestDatabase, CrashableLogStore, MemoryFiles)> {
        let files = MemoryFiles::new();
        let log = CrashableLogStore::new(files.log.clone());
        let engine = files.engine()?;
        let db = trellis_core::Database::open_with_store(
            Arc::new(log.clone()),
            Config::default().checkpoint_on_close(false),
            Arc::clone(&engine) as Arc<dyn StorageEngine>,
            &trellis_core::LoggingMonitor,
        )?;
        Ok((TestDatabase::from_parts(db, engine, None), log, files))
    }

    /// Tests that committed transactions survive losing everything that
    /// was not flushed.
    pub fn test_committed_data_survives(&mut self) -> CrashRecoveryResult {
        let description = "Committed transactions survive a crash";
        let db = TestDatabase::memory_with(Config::default().checkpoint_on_close(false));
        for label in 0..self.transactions {
            db.create_node(&[label as u32]);
        }
        let image = db.crash_image();
        drop(db);
        let result = check(description, self.transactions, &image);
        self.record(result)
    }

    /// Tests that a checkpoint whose entry never reached disk does not
    /// lose transactions.
    pub fn test_crash_during_checkpoint(&mut self) -> CrashRecoveryResult {
        let description = "Crash during checkpoint";
        let result = (|| {
            let (db, log, files) = self.open_crashable()?;
            for label in 0..self.transactions {
                db.create_node(&[label as u32]);
            }
            log.control().set_fail_on_flush(true);
            if db.checkpoint("crash test").is_ok() {
                return Ok(CrashRecoveryResult::fail(
                    description,
                    self.transactions,
                    self.transactions,
                    "checkpoint succeeded although flush failed",
                ));
            }
            let image = MemoryFiles {
                log: log.written_image(),
                ..files.crash_image()
            };
            drop(db);
            Ok(check(description, self.transactions, &image))
        })();
        let result = result.unwrap_or_else(|e: CoreError| {
            CrashRecoveryResult::fail(description, self.transactions, 0, &e.to_string())
        });
        self.record(result)
    }

    /// Crashes the workload after every `step` bytes of log writes and
    /// checks that recovery finds exactly the transactions whose commit
    /// returned.
    pub fn test_crash_sweep(&mut self, step: u64) -> CrashRecoveryResult {
        let description = "Crash at every write position";
        let total = match self.workload_bytes() {
            Ok(total) => total,
            Err(e) => {
                let result =
                    CrashRecoveryResult::fail(description, self.transactions, 0, &e.to_string());
                return self.record(result);
            }
        };

        let mut budget = 0;
        while budget <= total {
            let result = self.crash_after(budget);
            if !result.passed {
                let error = format!(
                    "budget {budget}: {}",
                    result.error.unwrap_or_default()
                );
                let failed = CrashRecoveryResult::fail(
                    description,
                    result.expected_transactions,
                    result.actual_transactions,
                    &error,
                );
                return self.record(failed);
            }
            budget += step.max(1);
        }
        self.record(CrashRecoveryResult::pass(description, self.transactions))
    }

    /// Bytes the workload writes after the database is open.
    fn workload_bytes(&self) -> CoreResult<u64> {
        let (db, log, _files) = self.open_crashable()?;
        let before = log.control().bytes_written();
        for label in 0..self.transactions {
            db.create_node(&[label as u32]);
        }
        Ok(log.control().bytes_written() - before)
    }

    fn crash_after(&self, budget: u64) -> CrashRecoveryResult {
        let description = "Crash after a write budget";
        let result = (|| {
            let (db, log, files) = self.open_crashable()?;
            log.control().crash_after(budget);
            let mut committed = 0;
            for label in 0..self.transactions {
                let created = db.commit_with(|tx| {
                    tx.create_node([label as u32]);
                    Ok(())
                });
                match created {
                    Ok(_) => committed += 1,
                    Err(_) => break,
                }
            }
            let image = MemoryFiles {
                log: log.written_image(),
                ..files.crash_image()
            };
            drop(db);
            Ok(check(description, committed, &image))
        })();
        result.unwrap_or_else(|e: CoreError| {
            CrashRecoveryResult::fail(description, 0, 0, &e.to_string())
        })
    }

    /// Returns true if every recorded test passed.
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_keeps_the_granted_prefix() {
        let store = CrashableLogStore::new(MemoryLogStore::new());
        let mut backend = store.open(0).unwrap();
        backend.append(b"abcd").unwrap();
        store.control().crash_after(2);

        assert!(backend.append(b"efgh").is_err());
        assert!(store.control().has_crashed());
        assert!(backend.flush().is_err());
        assert_eq!(store.written_image().file_bytes(0).unwrap(), b"abcdef");
    }

    #[test]
    fn reset_clears_the_crash() {
        let store = CrashableLogStore::new(MemoryLogStore::new());
        let mut backend = store.open(0).unwrap();
        store.control().crash_after(0);
        assert!(backend.append(b"x").is_err());

        store.control().reset();
        backend.append(b"y").unwrap();
        backend.flush().unwrap();
        assert_eq!(store.written_image().file_bytes(0).unwrap(), b"y");
    }
}
