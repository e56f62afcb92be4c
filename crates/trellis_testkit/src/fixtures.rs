//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases,
//! simulating a process crash and writing legacy-format logs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use trellis_codec::{encode_legacy_entry, FormatVersion, LogEntry, LogHeader, LogPosition};
use trellis_core::{
    Config, CoreError, CoreResult, Database, GraphStore, GraphTransaction, LoggingMonitor,
    MemoryLogStore, MemorySnapshot, StorageEngine, TransactionId,
};

/// In-memory files of a database: the log and both store slots.
#[derive(Debug, Clone)]
pub struct MemoryFiles {
    /// The transaction log.
    pub log: MemoryLogStore,
    /// Primary store slot.
    pub primary: MemorySnapshot,
    /// Counts store slot.
    pub counts: MemorySnapshot,
}

impl MemoryFiles {
    /// Creates empty files.
    pub fn new() -> Self {
        Self {
            log: MemoryLogStore::new(),
            primary: MemorySnapshot::new(),
            counts: MemorySnapshot::new(),
        }
    }

    /// Returns what a restarted process would find: flushed log bytes and
    /// the last written store snapshots.
    pub fn crash_image(&self) -> Self {
        Self {
            log: self.log.crash_copy(),
            primary: self.primary.copy(),
            counts: self.counts.copy(),
        }
    }

    /// Opens an engine over these files.
    pub fn engine(&self) -> CoreResult<Arc<GraphStore>> {
        Ok(Arc::new(GraphStore::with_slots(
            Box::new(self.primary.clone()),
            Box::new(self.counts.clone()),
        )?))
    }

    /// Opens a database over these files, running recovery.
    pub fn open(&self, config: Config) -> CoreResult<TestDatabase> {
        let engine = self.engine()?;
        let db = Database::open_with_store(
            Arc::new(self.log.clone()),
            config,
            Arc::clone(&engine) as Arc<dyn StorageEngine>,
            &LoggingMonitor,
        )?;
        Ok(TestDatabase::from_parts(db, engine, Some(self.clone())))
    }
}

impl Default for MemoryFiles {
    fn default() -> Self {
        Self::new()
    }
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// The engine the database applies to.
    pub engine: Arc<GraphStore>,
    files: Option<MemoryFiles>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self::memory_with(Config::default())
    }

    /// Creates a new in-memory test database with `config`.
    pub fn memory_with(config: Config) -> Self {
        MemoryFiles::new()
            .open(config)
            .expect("Failed to open in-memory database")
    }

    /// Creates a new file-based test database.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("test.trellis");
        let (db, engine) =
            open_file_database(&path, Config::default()).expect("Failed to open file database");
        Self {
            db,
            engine,
            files: None,
            _temp_dir: Some(temp_dir),
        }
    }

    pub(crate) fn from_parts(
        db: Database,
        engine: Arc<GraphStore>,
        files: Option<MemoryFiles>,
    ) -> Self {
        Self {
            db,
            engine,
            files,
            _temp_dir: None,
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir
            .as_ref()
            .map(|d| d.path().join("test.trellis"))
    }

    /// Returns the in-memory files, None if file-based.
    pub fn files(&self) -> Option<&MemoryFiles> {
        self.files.as_ref()
    }

    /// Captures what survives if the process died now.
    ///
    /// # Panics
    ///
    /// Panics for a file-based database.
    pub fn crash_image(&self) -> MemoryFiles {
        self.files
            .as_ref()
            .expect("Only in-memory databases can be crashed")
            .crash_image()
    }

    /// Commits the changes made by `f` in one transaction.
    pub fn commit_with<F>(&self, f: F) -> CoreResult<TransactionId>
    where
        F: FnOnce(&mut GraphTransaction<'_>) -> CoreResult<()>,
    {
        let mut tx = self.engine.begin();
        f(&mut tx)?;
        self.db.commit(tx.into_commands()?)
    }

    /// Commits the creation of a node and returns its transaction id.
    pub fn create_node(&self, labels: &[u32]) -> u64 {
        self.commit_with(|tx| {
            tx.create_node(labels.iter().copied());
            Ok(())
        })
        .expect("Failed to commit node")
        .id
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Opens the database at `path` over a [`GraphStore`] in the same directory.
pub fn open_file_database(path: &Path, config: Config) -> CoreResult<(Database, Arc<GraphStore>)> {
    let mut engine = None;
    let db = Database::open_with(path, config, &LoggingMonitor, |layout| {
        let store = Arc::new(GraphStore::open(layout)?);
        engine = Some(Arc::clone(&store));
        Ok(store as Arc<dyn StorageEngine>)
    })?;
    let engine =
        engine.ok_or_else(|| CoreError::invalid_operation("engine was not created"))?;
    Ok((db, engine))
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use trellis_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         db.create_node(&[1]);
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&TestDatabase) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&TestDatabase, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("File database should have a path");
    f(&test_db, &path)
}

/// Writes legacy-format log files.
///
/// Entries are written in the order they are added, so transactions of
/// different writers can be interleaved.
#[derive(Debug, Clone)]
pub struct LegacyLogBuilder {
    header: LogHeader,
    entries: Vec<(u32, LogEntry)>,
}

impl LegacyLogBuilder {
    /// Starts log version `log_version`.
    pub fn new(log_version: u64, last_committed_tx_id: u64) -> Self {
        Self {
            header: LogHeader {
                format_version: FormatVersion::Legacy,
                log_version,
                last_committed_tx_id,
            },
            entries: Vec::new(),
        }
    }

    /// Adds the start entry of `tx_id` for writer `identifier`.
    pub fn start(mut self, identifier: u32, tx_id: u64) -> Self {
        self.entries.push((
            identifier,
            LogEntry::Start {
                tx_id,
                last_committed_tx_id: tx_id.saturating_sub(1),
                timestamp: 1_000 + tx_id,
                leader_term: 0,
                additional_data: Vec::new(),
            },
        ));
        self
    }

    /// Adds a command entry for writer `identifier`.
    pub fn command(mut self, identifier: u32, payload: Vec<u8>) -> Self {
        self.entries
            .push((identifier, LogEntry::Command { payload }));
        self
    }

    /// Adds the commit entry of `tx_id` for writer `identifier`.
    pub fn commit(mut self, identifier: u32, tx_id: u64) -> Self {
        self.entries.push((
            identifier,
            LogEntry::Commit {
                tx_id,
                timestamp: 2_000 + tx_id,
                checksum: 0,
            },
        ));
        self
    }

    /// Adds a whole transaction with contiguous entries.
    pub fn transaction(self, identifier: u32, tx_id: u64, commands: &[Vec<u8>]) -> Self {
        let builder = self.start(identifier, tx_id);
        commands
            .iter()
            .fold(builder, |b, payload| b.command(identifier, payload.clone()))
            .commit(identifier, tx_id)
    }

    /// Adds a checkpoint entry.
    pub fn checkpoint(mut self, position: LogPosition, last_tx_id: u64) -> Self {
        self.entries.push((
            0,
            LogEntry::Checkpoint {
                position,
                last_tx_id,
                timestamp: 3_000 + last_tx_id,
                reason: "legacy checkpoint".to_string(),
            },
        ));
        self
    }

    /// Adds a checkpoint entry whose position is its own.
    pub fn checkpoint_here(self, last_tx_id: u64) -> Self {
        let position = LogPosition::new(self.header.log_version, self.build().len() as u64);
        self.checkpoint(position, last_tx_id)
    }

    /// Returns the file contents.
    pub fn build(&self) -> Vec<u8> {
        let mut bytes = self.header.encode();
        for (identifier, entry) in &self.entries {
            encode_legacy_entry(entry, *identifier, &mut bytes).expect("Failed to encode entry");
        }
        bytes
    }

    /// Writes the file into `store` as a durable version.
    pub fn install(&self, store: &MemoryLogStore) {
        store.insert(self.header.log_version, self.build());
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a database holding a chain of `node_count` nodes, each
    /// linked to the previous one, one transaction per change.
    pub fn populated_database(node_count: usize) -> TestDatabase {
        let db = TestDatabase::memory_with(Config::default().checkpoint_on_close(false));
        let mut previous: Option<u64> = None;
        for i in 0..node_count {
            let mut created = None;
            db.commit_with(|tx| {
                let node = tx.create_node([(i % 4) as u32]);
                if let Some(previous) = previous {
                    tx.create_relationship(previous, 1, node)?;
                }
                created = Some(node);
                Ok(())
            })
            .expect("Failed to populate database");
            previous = created;
        }
        db
    }
}
