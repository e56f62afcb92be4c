//! CLI command implementations.

pub mod dump_log;
pub mod inspect;
pub mod migrate;
pub mod reapply;
pub mod recover;
pub mod verify;

use std::path::Path;
use std::sync::Arc;
use trellis_core::{DatabaseLayout, FileLogStore, LogFiles};

/// Read buffer used by the tools.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Result type shared by the commands.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Opens the log of the database at `path` for reading, without locking it.
pub fn open_log(path: &Path) -> CliResult<(DatabaseLayout, LogFiles)> {
    let layout = DatabaseLayout::new(path);
    let logs_dir = layout.logs_dir();
    if !logs_dir.is_dir() {
        return Err(format!("No transaction log found at {}", logs_dir.display()).into());
    }
    let store = FileLogStore::new(logs_dir)?;
    let files = LogFiles::new(Arc::new(store), u64::MAX, READ_BUFFER_SIZE);
    Ok((layout, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use trellis_core::{Config, Database, GraphStore, StorageEngine};

    #[test]
    fn missing_log_directory_is_reported() {
        let dir = tempdir().unwrap();
        let err = open_log(&dir.path().join("absent")).unwrap_err();
        assert!(err.to_string().contains("No transaction log"));
    }

    #[test]
    fn open_log_reads_a_database_without_locking_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let db = Database::open_with(&path, Config::default(), &trellis_core::LoggingMonitor, |layout| {
            Ok(Arc::new(GraphStore::open(layout)?) as Arc<dyn StorageEngine>)
        })
        .unwrap();

        let (layout, files) = open_log(&path).unwrap();
        assert_eq!(layout.logs_dir(), path.join("logs"));
        assert_eq!(files.versions().unwrap(), vec![0]);
        drop(db);
    }
}
