//! Database facade.

use crate::checkpoint::{CheckpointRecord, CheckpointThreshold, Checkpointer};
use crate::config::Config;
use crate::dir::{DatabaseDir, DatabaseLayout};
use crate::engine::{ApplyMode, CommandBatch, StorageEngine};
use crate::error::{CoreError, CoreResult};
use crate::log::{FileLogStore, LogFiles, LogStore, MemoryLogStore, TransactionAppender, TransactionRepresentation};
use crate::recovery::{LoggingMonitor, RecoveryMonitor, RecoveryOrchestrator, RecoveryReport};
use crate::types::TransactionId;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use trellis_codec::LogPosition;

/// An open database: a transaction log in front of a storage engine.
///
/// Opening a database recovers the engine from the log. Afterwards
/// [`Database::commit`] appends a transaction, waits until it is durable
/// and applies it to the engine.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use trellis_core::{Config, Database, GraphStore};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// let db = Database::open_with(Path::new("my_db"), Config::default(), &LoggingMonitor, |layout| {
///     Ok(Arc::new(GraphStore::open(layout)?))
/// })?;
/// db.commit(commands)?;
/// db.close()?;
/// ```
///
/// # In-Memory Databases
///
/// For testing, use `Database::open_in_memory()`:
///
/// ```rust,ignore
/// let db = Database::open_in_memory(Arc::new(GraphStore::in_memory()))?;
/// ```
pub struct Database {
    /// Configuration.
    config: Config,
    /// Database directory (holds the lock). None for in-memory databases.
    dir: Option<DatabaseDir>,
    /// Log files.
    files: Arc<LogFiles>,
    /// Storage engine the log is applied to.
    engine: Arc<dyn StorageEngine>,
    /// Transaction appender.
    appender: Arc<TransactionAppender>,
    /// Checkpointer.
    checkpointer: Checkpointer,
    /// What recovery did on open.
    report: RecoveryReport,
    /// Set when the engine failed to apply a committed transaction.
    apply_failed: AtomicBool,
    /// Whether the database is open.
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens the database at `path` on an already opened engine.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another process holds the directory,
    /// or any recovery error.
    pub fn open(path: &Path, config: Config, engine: Arc<dyn StorageEngine>) -> CoreResult<Self> {
        Self::open_with(path, config, &LoggingMonitor, |_| Ok(engine))
    }

    /// Opens the database at `path`, reporting recovery to `monitor`.
    ///
    /// # Errors
    ///
    /// See [`Database::open`].
    pub fn open_with_monitor(
        path: &Path,
        config: Config,
        engine: Arc<dyn StorageEngine>,
        monitor: &dyn RecoveryMonitor,
    ) -> CoreResult<Self> {
        Self::open_with(path, config, monitor, |_| Ok(engine))
    }

    /// Opens the database at `path`, creating the engine once the
    /// directory is locked.
    ///
    /// This is the usual way to open a [`GraphStore`](crate::GraphStore),
    /// whose files live in the database directory.
    ///
    /// # Errors
    ///
    /// See [`Database::open`]; errors from `make_engine` are returned as is.
    pub fn open_with<F>(
        path: &Path,
        config: Config,
        monitor: &dyn RecoveryMonitor,
        make_engine: F,
    ) -> CoreResult<Self>
    where
        F: FnOnce(&DatabaseLayout) -> CoreResult<Arc<dyn StorageEngine>>,
    {
        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        let engine = make_engine(dir.layout())?;
        let store = Arc::new(FileLogStore::new(dir.layout().logs_dir())?);
        Self::start(Some(dir), store, config, engine, monitor)
    }

    /// Opens a database whose log lives in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be flushed by the initial
    /// checkpoint.
    pub fn open_in_memory(engine: Arc<dyn StorageEngine>) -> CoreResult<Self> {
        Self::start(
            None,
            Arc::new(MemoryLogStore::new()),
            Config::default(),
            engine,
            &LoggingMonitor,
        )
    }

    /// Opens a database on an explicit log store.
    ///
    /// No directory lock is taken.
    ///
    /// # Errors
    ///
    /// Returns any recovery error.
    pub fn open_with_store(
        store: Arc<dyn LogStore>,
        config: Config,
        engine: Arc<dyn StorageEngine>,
        monitor: &dyn RecoveryMonitor,
    ) -> CoreResult<Self> {
        Self::start(None, store, config, engine, monitor)
    }

    fn start(
        dir: Option<DatabaseDir>,
        store: Arc<dyn LogStore>,
        config: Config,
        engine: Arc<dyn StorageEngine>,
        monitor: &dyn RecoveryMonitor,
    ) -> CoreResult<Self> {
        let files = Arc::new(LogFiles::new(store, config.max_log_size, config.read_buffer_size));

        let mut recovery = RecoveryOrchestrator::new(&files, engine.as_ref(), &config, monitor);
        recovery.recover()?;
        let last_committed = recovery.last_committed_tx_id();

        files.activate(last_committed)?;
        let appender = Arc::new(TransactionAppender::new(
            Arc::clone(&files),
            last_committed,
            config.group_commit_window,
        ));
        let checkpointer = Checkpointer::new(
            Arc::clone(&appender),
            Arc::clone(&engine),
            recovery.last_checkpoint_if_current(),
            CheckpointThreshold::new(
                config.checkpoint_threshold_transactions,
                config.checkpoint_threshold_log_bytes,
            ),
        );
        recovery.complete(&checkpointer)?;
        let report = recovery.into_report();
        info!(
            last_committed_tx_id = last_committed,
            replayed = report.replayed_transactions,
            "database open"
        );

        Ok(Self {
            config,
            dir,
            files,
            engine,
            appender,
            checkpointer,
            report,
            apply_failed: AtomicBool::new(false),
            is_open: RwLock::new(true),
        })
    }

    /// Commits `commands` as the next transaction.
    ///
    /// # Errors
    ///
    /// See [`Database::commit_transaction`].
    pub fn commit(&self, commands: Vec<Vec<u8>>) -> CoreResult<TransactionId> {
        self.commit_transaction(TransactionRepresentation::new(commands))
    }

    /// Commits `tx`, assigning it the next transaction id.
    ///
    /// Returns once the transaction is durable and applied.
    ///
    /// # Errors
    ///
    /// - `DatabaseClosed` after [`Database::close`]
    /// - `LogUnhealthy` if an earlier flush failed
    /// - `Apply` if the engine rejects the transaction; it is durable in
    ///   the log nonetheless and the database refuses further commits
    pub fn commit_transaction(&self, mut tx: TransactionRepresentation) -> CoreResult<TransactionId> {
        self.ensure_open()?;
        if self.apply_failed.load(Ordering::Acquire) {
            return Err(CoreError::invalid_operation(
                "a committed transaction failed to apply; reopen the database to recover",
            ));
        }

        let (id, checkpoint_due) = {
            let _guard = self.checkpointer.commit_guard();
            let commitment = self.appender.append_next(&mut tx)?;
            commitment.wait_until_durable()?;

            let batch = CommandBatch {
                tx_id: tx.tx_id,
                timestamp: tx.timestamp,
                commands: &tx.commands,
            };
            if let Err(source) = self.engine.apply(&batch, ApplyMode::Normal) {
                self.apply_failed.store(true, Ordering::Release);
                error!(tx_id = tx.tx_id, error = %source, "applying committed transaction failed");
                return Err(CoreError::Apply {
                    tx_id: tx.tx_id,
                    position: commitment.position(),
                    source,
                });
            }

            let bytes = commitment
                .end_position()
                .byte_offset
                .saturating_sub(commitment.position().byte_offset);
            (commitment.transaction_id(), self.checkpointer.record_commit(bytes))
        };

        if checkpoint_due {
            if let Err(err) = self.checkpointer.force_checkpoint("threshold reached") {
                warn!(error = %err, "threshold checkpoint failed");
            }
        }
        Ok(id)
    }

    /// Forces a checkpoint and returns the position it records.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or the log or engine
    /// cannot be made durable.
    pub fn checkpoint(&self, reason: &str) -> CoreResult<LogPosition> {
        self.ensure_open()?;
        self.checkpointer.force_checkpoint(reason)
    }

    /// Checkpoints unless in-flight commits hold the lock past `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Database::checkpoint`].
    pub fn try_checkpoint(&self, reason: &str, timeout: Duration) -> CoreResult<Option<LogPosition>> {
        self.ensure_open()?;
        self.checkpointer.try_checkpoint(reason, timeout)
    }

    /// The newest checkpoint.
    #[must_use]
    pub fn last_checkpoint(&self) -> Option<CheckpointRecord> {
        self.checkpointer.last_checkpoint()
    }

    /// What recovery did when the database was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Id of the last committed transaction.
    #[must_use]
    pub fn last_committed_transaction_id(&self) -> u64 {
        self.appender.last_committed_tx_id()
    }

    /// Number of log flushes performed since opening.
    #[must_use]
    pub fn log_force_count(&self) -> u64 {
        self.appender.force_count()
    }

    /// The log files.
    #[must_use]
    pub fn log_files(&self) -> &Arc<LogFiles> {
        &self.files
    }

    /// The storage engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Returns the directory layout, for on-disk databases.
    #[must_use]
    pub fn layout(&self) -> Option<&DatabaseLayout> {
        self.dir.as_ref().map(DatabaseDir::layout)
    }

    /// Returns database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Closes the database.
    ///
    /// Forces a `"database shutdown"` checkpoint if configured, so the next
    /// open has nothing to replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint or the final log flush fails.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }
        *is_open = false;

        let clean = self.appender.is_healthy() && !self.apply_failed.load(Ordering::Acquire);
        if self.config.checkpoint_on_close && clean {
            self.checkpointer.force_checkpoint("database shutdown")?;
        }
        self.files.close()?;
        info!(
            last_committed_tx_id = self.appender.last_committed_tx_id(),
            "database closed"
        );
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("last_committed", &self.last_committed_transaction_id())
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "closing database on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::GraphStore;
    use crate::recovery::RecoveryOutcome;

    fn open() -> (Arc<GraphStore>, Database) {
        let engine = Arc::new(GraphStore::in_memory());
        let db = Database::open_in_memory(Arc::clone(&engine) as Arc<dyn StorageEngine>).unwrap();
        (engine, db)
    }

    fn create_node(engine: &GraphStore, db: &Database, label: u32) -> TransactionId {
        let mut tx = engine.begin();
        tx.create_node([label]);
        db.commit(tx.into_commands().unwrap()).unwrap()
    }

    #[test]
    fn open_in_memory() {
        let (_, db) = open();
        assert!(db.is_open());
        assert_eq!(db.recovery_report().outcome, RecoveryOutcome::NotNeeded);
        assert_eq!(db.last_committed_transaction_id(), 0);
    }

    #[test]
    fn commit_assigns_dense_ids_and_applies() {
        let (engine, db) = open();
        assert_eq!(create_node(&engine, &db, 1).id, 1);
        assert_eq!(create_node(&engine, &db, 2).id, 2);
        assert_eq!(engine.node_count(), 2);
        assert_eq!(engine.counts_snapshot().node_count(2), 1);
        assert_eq!(db.last_committed_transaction_id(), 2);
    }

    #[test]
    fn closed_database_rejects_commits() {
        let (_, db) = open();
        db.close().unwrap();
        assert!(matches!(db.commit(Vec::new()), Err(CoreError::DatabaseClosed)));
        assert!(matches!(db.checkpoint("late"), Err(CoreError::DatabaseClosed)));
        db.close().unwrap();
    }

    #[test]
    fn undecodable_command_stops_commits() {
        let (_, db) = open();
        let err = db.commit(vec![vec![0xff, 0x00]]).unwrap_err();
        assert!(matches!(err, CoreError::Apply { tx_id: 1, .. }));
        assert!(matches!(
            db.commit(Vec::new()),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn threshold_triggers_checkpoint() {
        let engine = Arc::new(GraphStore::in_memory());
        let db = Database::open_with_store(
            Arc::new(MemoryLogStore::new()),
            Config::default().checkpoint_threshold_transactions(2),
            Arc::clone(&engine) as Arc<dyn StorageEngine>,
            &LoggingMonitor,
        )
        .unwrap();
        create_node(&engine, &db, 1);
        assert!(db.last_checkpoint().is_none());
        create_node(&engine, &db, 1);
        assert_eq!(db.last_checkpoint().unwrap().last_tx_id, 2);
    }
}
