//! Atomically replaced snapshot files.
//!
//! ```text
//! | magic "TSNP" (4) | kind (1) | length (8) | body (length) | crc32 (4) |
//! ```

use crate::dir::sync_directory;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SNAPSHOT_MAGIC: [u8; 4] = *b"TSNP";
const ENVELOPE_PREFIX: usize = 13;
const CRC_SIZE: usize = 4;

/// A place holding one snapshot.
pub trait SnapshotSlot: Send + Sync + fmt::Debug {
    /// Reads the snapshot, or `None` if nothing was ever stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot exists but cannot be read.
    fn load(&self) -> CoreResult<Option<Vec<u8>>>;

    /// Replaces the snapshot. Either the old or the new bytes survive a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the new bytes cannot be made durable.
    fn store(&self, bytes: &[u8]) -> CoreResult<()>;
}

/// Snapshot kept in a file, replaced by write-then-rename.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    path: PathBuf,
}

impl FileSnapshot {
    /// Creates a slot backed by `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl SnapshotSlot for FileSnapshot {
    fn load(&self) -> CoreResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, bytes: &[u8]) -> CoreResult<()> {
        let temp = self.temp_path();
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &self.path)?;
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => sync_directory(parent),
            _ => Ok(()),
        }
    }
}

/// Snapshot kept in memory. Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemorySnapshot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an independent slot with the same contents.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(self.bytes.lock().clone())),
        }
    }

    /// Overwrites the stored bytes, bypassing any envelope.
    pub fn set_raw(&self, bytes: Option<Vec<u8>>) {
        *self.bytes.lock() = bytes;
    }
}

impl SnapshotSlot for MemorySnapshot {
    fn load(&self) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.bytes.lock().clone())
    }

    fn store(&self, bytes: &[u8]) -> CoreResult<()> {
        *self.bytes.lock() = Some(bytes.to_vec());
        Ok(())
    }
}

/// Wraps `body` in a checksummed envelope tagged with `kind`.
pub(crate) fn seal(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_PREFIX + body.len() + CRC_SIZE);
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.push(kind);
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(body);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Checks the envelope around a snapshot and returns its body.
pub(crate) fn unseal(kind: u8, bytes: &[u8]) -> CoreResult<&[u8]> {
    if bytes.len() < ENVELOPE_PREFIX + CRC_SIZE || bytes[..4] != SNAPSHOT_MAGIC {
        return Err(CoreError::corrupt_store("bad snapshot magic"));
    }
    if bytes[4] != kind {
        return Err(CoreError::corrupt_store(format!(
            "snapshot kind {} where {kind} was expected",
            bytes[4]
        )));
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[5..ENVELOPE_PREFIX]);
    let len = u64::from_le_bytes(len);
    let total = (ENVELOPE_PREFIX as u64)
        .checked_add(len)
        .and_then(|n| n.checked_add(CRC_SIZE as u64));
    if total != Some(bytes.len() as u64) {
        return Err(CoreError::corrupt_store("snapshot length does not match file size"));
    }

    let body_end = bytes.len() - CRC_SIZE;
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&bytes[body_end..]);
    let stored = u32::from_le_bytes(stored);
    let actual = crc32fast::hash(&bytes[..body_end]);
    if stored != actual {
        return Err(CoreError::corrupt_store(format!(
            "snapshot checksum mismatch: expected {stored:08x}, got {actual:08x}"
        )));
    }
    Ok(&bytes[ENVELOPE_PREFIX..body_end])
}
