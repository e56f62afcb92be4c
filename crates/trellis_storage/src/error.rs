//! Errors raised by storage backends.

use std::io;
use thiserror::Error;

/// Result of a backend operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// Why a backend operation failed.
///
/// Backends never interpret the bytes they hold, so there is no corruption
/// variant here; damaged contents are detected by the log codec.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system reported a failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read asked for bytes past the logical end.
    #[error("read of {len} bytes at offset {offset} runs past the end ({size} bytes)")]
    ReadPastEnd {
        /// First byte requested.
        offset: u64,
        /// Bytes requested.
        len: usize,
        /// Logical size at the time of the read.
        size: u64,
    },

    /// A truncate asked to grow the storage.
    #[error("cannot truncate to {requested} bytes, storage holds {size}")]
    InvalidTruncate {
        /// Requested size.
        requested: u64,
        /// Logical size at the time of the call.
        size: u64,
    },
}
