//! The byte store every log version and snapshot sits on.

use crate::error::StorageResult;

/// An append-only byte store with explicit durability points.
///
/// Trellis gives each log version its own backend and owns the format of
/// what is written; a backend only tracks bytes and their logical length.
///
/// What the log needs from an implementation:
///
/// 1. `append` writes at the logical end and returns that offset, so frame
///    positions can be computed before the bytes are durable.
/// 2. `read_at` sees every appended byte, flushed or not.
/// 3. After `flush` returns, every byte appended before the call survives a
///    crash. Nothing appended later is promised anything.
/// 4. A failed `flush` leaves the durability of unflushed bytes unknown.
///    The log treats that as fatal for the writer.
pub trait StorageBackend: Send + Sync {
    /// Reads exactly `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// `ReadPastEnd` if the range ends after the logical end, or the I/O
    /// error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset of its first byte.
    ///
    /// # Errors
    ///
    /// Returns the I/O error. Part of `data` may have been written.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Makes every appended byte durable.
    ///
    /// # Errors
    ///
    /// Returns the I/O error; see rule 4 above.
    fn flush(&mut self) -> StorageResult<()>;

    /// Logical size, which is also the offset of the next append.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the size has to be queried.
    fn size(&self) -> StorageResult<u64>;

    /// Like `flush`, but the file length and other metadata are made
    /// durable as well.
    ///
    /// # Errors
    ///
    /// Returns the I/O error.
    fn sync(&mut self) -> StorageResult<()>;

    /// Shrinks the storage to `new_size` bytes, durably.
    ///
    /// Recovery uses this to cut a torn or rejected tail before appending.
    ///
    /// # Errors
    ///
    /// `InvalidTruncate` if `new_size` is larger than the logical size, or
    /// the I/O error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads from `offset` to the logical end.
    ///
    /// # Errors
    ///
    /// See [`StorageBackend::read_at`].
    fn read_from(&self, offset: u64) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(offset, size.saturating_sub(offset) as usize)
    }
}
