//! Where log files live.
//!
//! A [`LogStore`] maps log versions to byte backends. [`FileLogStore`] keeps
//! one file per version in a directory; [`MemoryLogStore`] keeps them in
//! memory and can produce the image a crash would leave behind.

use crate::dir::sync_directory;
use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trellis_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// File name prefix of every log file.
pub const LOG_FILE_PREFIX: &str = "transaction.log.";

/// Suffix given to a log file that was replaced by a migrated copy.
pub const LEGACY_SUFFIX: &str = "legacy";

const MIGRATING_SUFFIX: &str = "migrating";

/// A set of versioned log files.
pub trait LogStore: Send + Sync + fmt::Debug {
    /// Returns the versions present, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    fn versions(&self) -> CoreResult<Vec<u64>>;

    /// Opens the file for `version`, creating it empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    fn open(&self, version: u64) -> CoreResult<Box<dyn StorageBackend>>;

    /// Deletes the file for `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn remove(&self, version: u64) -> CoreResult<()>;

    /// Atomically replaces the contents of `version`, keeping the old
    /// contents as an archived copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the new contents cannot be made durable or the
    /// swap fails. The original file is untouched unless the swap succeeded.
    fn replace(&self, version: u64, contents: &[u8]) -> CoreResult<()>;

    /// Human-readable location of `version`, for messages.
    fn describe(&self, version: u64) -> String;
}

/// Log files in a directory, named `transaction.log.<version>`.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    /// Opens the log directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Returns the log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the file for `version`.
    #[must_use]
    pub fn path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{LOG_FILE_PREFIX}{version}"))
    }

    fn sibling(&self, version: u64, suffix: &str) -> PathBuf {
        self.dir.join(format!("{LOG_FILE_PREFIX}{version}.{suffix}"))
    }

}

impl LogStore for FileLogStore {
    fn versions(&self) -> CoreResult<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(version) = name
                .strip_prefix(LOG_FILE_PREFIX)
                .and_then(|rest| rest.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn open(&self, version: u64) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open(&self.path(version))?))
    }

    fn remove(&self, version: u64) -> CoreResult<()> {
        let path = self.path(version);
        if path.exists() {
            fs::remove_file(&path)?;
            sync_directory(&self.dir)?;
        }
        Ok(())
    }

    fn replace(&self, version: u64, contents: &[u8]) -> CoreResult<()> {
        let target = self.path(version);
        let staging = self.sibling(version, MIGRATING_SUFFIX);
        let archive = self.sibling(version, LEGACY_SUFFIX);

        {
            let mut file = File::create(&staging)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }

        fs::rename(&target, &archive)?;
        fs::rename(&staging, &target)?;
        sync_directory(&self.dir)?;
        Ok(())
    }

    fn describe(&self, version: u64) -> String {
        self.path(version).display().to_string()
    }
}

/// Log files held in memory.
///
/// Clones share the same files. Use [`MemoryLogStore::crash_copy`] to get
/// the store a restarted process would see.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    files: Arc<Mutex<BTreeMap<u64, InMemoryBackend>>>,
    archived: Arc<Mutex<BTreeMap<u64, Vec<u8>>>>,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a durable file for `version`, replacing any existing one.
    pub fn insert(&self, version: u64, bytes: Vec<u8>) {
        self.files
            .lock()
            .insert(version, InMemoryBackend::with_data(bytes));
    }

    /// Returns all bytes of `version`, flushed or not.
    #[must_use]
    pub fn file_bytes(&self, version: u64) -> Option<Vec<u8>> {
        self.files.lock().get(&version).map(InMemoryBackend::data)
    }

    /// Returns the archived contents of `version` left by [`LogStore::replace`].
    #[must_use]
    pub fn archived(&self, version: u64) -> Option<Vec<u8>> {
        self.archived.lock().get(&version).cloned()
    }

    /// Returns an independent store holding only flushed bytes.
    #[must_use]
    pub fn crash_copy(&self) -> Self {
        let files = self
            .files
            .lock()
            .iter()
            .map(|(version, backend)| (*version, backend.crash_copy()))
            .collect();
        Self {
            files: Arc::new(Mutex::new(files)),
            archived: Arc::new(Mutex::new(self.archived.lock().clone())),
        }
    }
}

impl LogStore for MemoryLogStore {
    fn versions(&self) -> CoreResult<Vec<u64>> {
        Ok(self.files.lock().keys().copied().collect())
    }

    fn open(&self, version: u64) -> CoreResult<Box<dyn StorageBackend>> {
        let backend = self.files.lock().entry(version).or_default().clone();
        Ok(Box::new(backend))
    }

    fn remove(&self, version: u64) -> CoreResult<()> {
        self.files.lock().remove(&version);
        Ok(())
    }

    fn replace(&self, version: u64, contents: &[u8]) -> CoreResult<()> {
        let mut files = self.files.lock();
        if let Some(previous) = files.insert(version, InMemoryBackend::with_data(contents.to_vec())) {
            self.archived.lock().insert(version, previous.data());
        }
        Ok(())
    }

    fn describe(&self, version: u64) -> String {
        format!("memory:{LOG_FILE_PREFIX}{version}")
    }
}
