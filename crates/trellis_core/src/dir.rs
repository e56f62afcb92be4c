//! Database directory management.
//!
//! This module handles the file system layout for Trellis:
//!
//! ```text
//! <db_path>/
//! ├─ LOCK                     # Advisory lock for single-writer
//! ├─ primary.store            # Node and relationship records
//! ├─ counts.store             # Per-label / per-type counts
//! └─ logs/
//!    ├─ transaction.log.0     # Transaction log, one file per version
//!    └─ transaction.log.1
//! ```
//!
//! The LOCK file ensures only one process can write to the database at a time.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOGS_DIR: &str = "logs";
const PRIMARY_STORE_FILE: &str = "primary.store";
const COUNTS_STORE_FILE: &str = "counts.store";

/// Paths of every file in a database directory.
///
/// A layout does not touch the file system; tools use it to look at a
/// database without locking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseLayout {
    root: PathBuf,
}

impl DatabaseLayout {
    /// Creates the layout for the database at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the database directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding the transaction log files.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Returns the path of the primary store snapshot.
    #[must_use]
    pub fn primary_store_path(&self) -> PathBuf {
        self.root.join(PRIMARY_STORE_FILE)
    }

    /// Returns the path of the counts store snapshot.
    #[must_use]
    pub fn counts_store_path(&self) -> PathBuf {
        self.root.join(COUNTS_STORE_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }
}

/// Manages the database directory and holds its exclusive lock.
///
/// # Example
///
/// ```rust,ignore
/// use trellis_core::DatabaseDir;
/// use std::path::Path;
///
/// let dir = DatabaseDir::open(Path::new("my_db"), true)?;
/// println!("logs: {:?}", dir.layout().logs_dir());
/// ```
#[derive(Debug)]
pub struct DatabaseDir {
    layout: DatabaseLayout,
    /// Lock file handle (held for exclusive access).
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `DatabaseLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let layout = DatabaseLayout::new(path);
        fs::create_dir_all(layout.logs_dir())?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(layout.lock_path())?;

        // Non-blocking: a second writer fails fast.
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            layout,
            _lock_file: lock_file,
        })
    }

    /// Returns the directory layout.
    #[must_use]
    pub fn layout(&self) -> &DatabaseLayout {
        &self.layout
    }
}

/// Makes creations, renames and removals inside `dir` durable.
///
/// NTFS journals directory metadata itself, so this is a no-op off Unix.
#[cfg(unix)]
pub(crate) fn sync_directory(dir: &Path) -> CoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_dir: &Path) -> CoreResult<()> {
    Ok(())
}
