//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    /// Length of the prefix that has been flushed.
    durable: usize,
}

/// An in-memory storage backend.
///
/// Clones share the same underlying bytes, so a log store can hand out
/// several handles to one logical file.
///
/// The backend remembers how many bytes were covered by the last successful
/// `flush`. [`InMemoryBackend::crash_copy`] produces an independent backend
/// holding only those bytes, which is what a process crash would leave behind.
///
/// # Example
///
/// ```rust
/// use trellis_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.append(b"durable").unwrap();
/// backend.flush().unwrap();
/// backend.append(b" lost").unwrap();
///
/// let after_crash = backend.crash_copy();
/// assert_eq!(after_crash.data(), b"durable");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing, durable data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let durable = data.len();
        Self {
            state: Arc::new(RwLock::new(MemoryState { data, durable })),
        }
    }

    /// Returns a copy of all data in the backend, flushed or not.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.state.read().data.clone()
    }

    /// Returns the number of bytes covered by the last successful flush.
    #[must_use]
    pub fn durable_len(&self) -> u64 {
        self.state.read().durable as u64
    }

    /// Returns an independent backend containing only the flushed bytes.
    #[must_use]
    pub fn crash_copy(&self) -> Self {
        let state = self.state.read();
        Self::with_data(state.data[..state.durable].to_vec())
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let state = self.state.read();
        let size = state.data.len() as u64;
        let offset_usize = offset as usize;
        let end = offset_usize.saturating_add(len);

        if offset > size || end > state.data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(state.data[offset_usize..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let mut state = self.state.write();
        let offset = state.data.len() as u64;
        state.data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.durable = state.data.len();
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.read().data.len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.flush()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut state = self.state.write();
        let current_size = state.data.len() as u64;

        if new_size > current_size {
            return Err(StorageError::InvalidTruncate {
                requested: new_size,
                size: current_size,
            });
        }

        state.data.truncate(new_size as usize);
        // Truncation is durable immediately, like `set_len` followed by `sync_all`.
        state.durable = state.data.len();
        Ok(())
    }
}
