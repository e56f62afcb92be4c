//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
///
/// [`CodecError::Truncated`] is the only variant that is expected in normal
/// operation: it is what the tail of a log looks like after a crash in the
/// middle of a write. Every other decode error means the bytes are damaged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes are available than the frame declares.
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required to decode the frame.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// Unknown tag or internally inconsistent lengths.
    #[error("corrupt entry: {reason}")]
    Corrupt {
        /// Description of the inconsistency.
        reason: String,
    },

    /// A complete frame whose stored checksum does not match its contents.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Checksum stored in the frame.
        expected: u32,
        /// Checksum computed over the frame.
        actual: u32,
    },

    /// The header names a format version this build cannot read.
    #[error("unsupported log format version {0}")]
    UnsupportedFormat(u8),

    /// A payload is too large to be framed.
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    PayloadTooLarge {
        /// Actual payload length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },
}

impl CodecError {
    /// Create a corrupt entry error.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    /// Returns true if this error only signals the end of readable data.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}
