//! Error types for Trellis core.

use crate::engine::ApplyError;
use std::io;
use thiserror::Error;
use trellis_codec::{CodecError, LogPosition};

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Trellis core operations.
///
/// A truncated entry at the end of the log never surfaces as an error; it
/// only ends a scan. The corruption variants are fatal to startup.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] trellis_storage::StorageError),

    /// Log codec error outside of a log scan.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Reading a log file failed.
    #[error("log read failed at {position}: {source}")]
    LogRead {
        /// Where the read started.
        position: LogPosition,
        /// Backend error.
        #[source]
        source: trellis_storage::StorageError,
    },

    /// The log contains an entry that cannot be decoded or is out of place.
    #[error("corrupt log at {position}: {message}")]
    CorruptLog {
        /// Where the bad entry starts.
        position: LogPosition,
        /// Description of the corruption.
        message: String,
    },

    /// A complete frame failed its CRC.
    #[error("checksum mismatch at {position}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Where the frame starts.
        position: LogPosition,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A commit entry does not match the transaction it closes.
    #[error(
        "transaction {tx_id} checksum mismatch at {position}: expected {expected:016x}, got {actual:016x}"
    )]
    TransactionChecksumMismatch {
        /// Transaction id.
        tx_id: u64,
        /// Where the commit entry starts.
        position: LogPosition,
        /// Checksum stored in the commit entry.
        expected: u64,
        /// Checksum computed from the transaction contents.
        actual: u64,
    },

    /// A transaction was appended out of id order. Nothing was written.
    #[error("out of order transaction: expected id {expected}, got {actual}")]
    OutOfOrderTransaction {
        /// The only id the appender would accept.
        expected: u64,
        /// The id that was offered.
        actual: u64,
    },

    /// The storage engine failed to apply a committed transaction.
    #[error("applying transaction {tx_id} at {position} failed: {source}")]
    Apply {
        /// Transaction id.
        tx_id: u64,
        /// Position of the transaction's commit entry.
        position: LogPosition,
        /// Engine error.
        #[source]
        source: ApplyError,
    },

    /// Startup recovery failed.
    #[error("recovery failed at {position} after transaction {last_tx_id}: {source}")]
    RecoveryFailed {
        /// Last log position recovery reached.
        position: LogPosition,
        /// Last transaction recovery replayed or confirmed.
        last_tx_id: u64,
        /// Underlying error.
        #[source]
        source: Box<CoreError>,
    },

    /// The store has applied transactions but no log files exist.
    #[error("no transaction logs found, but the store has applied transactions up to {last_applied_tx_id}")]
    MissingLogs {
        /// Last transaction the store reports as applied.
        last_applied_tx_id: u64,
    },

    /// Point-in-time recovery cannot honour the requested criteria.
    #[error("recovery criteria cannot be satisfied: {message}")]
    RecoveryCriteriaUnsatisfiable {
        /// Why not.
        message: String,
    },

    /// Recovery was cancelled before completing.
    #[error("recovery cancelled")]
    Cancelled,

    /// A log flush failed earlier; durability of written bytes is unknown.
    #[error("transaction log is unhealthy: {message}")]
    LogUnhealthy {
        /// The original failure.
        message: String,
    },

    /// A store snapshot file is damaged.
    #[error("corrupt store file: {message}")]
    CorruptStore {
        /// Description of the damage.
        message: String,
    },

    /// Serializing or deserializing an engine structure failed.
    #[error("encoding error: {message}")]
    Encoding {
        /// Description of the failure.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Migration failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates a corrupt log error.
    pub fn corrupt_log(position: LogPosition, message: impl Into<String>) -> Self {
        Self::CorruptLog {
            position,
            message: message.into(),
        }
    }

    /// Maps a codec error raised while decoding at `position`.
    pub fn from_codec(err: CodecError, position: LogPosition) -> Self {
        match err {
            CodecError::ChecksumMismatch { expected, actual } => Self::ChecksumMismatch {
                position,
                expected,
                actual,
            },
            CodecError::UnsupportedFormat(version) => {
                Self::invalid_format(format!("unsupported log format {version} at {position}"))
            }
            other => Self::corrupt_log(position, other.to_string()),
        }
    }

    /// Creates a corrupt store error.
    pub fn corrupt_store(message: impl Into<String>) -> Self {
        Self::CorruptStore {
            message: message.into(),
        }
    }

    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Returns true for errors that indicate damaged log contents.
    #[must_use]
    pub fn is_log_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptLog { .. }
                | Self::ChecksumMismatch { .. }
                | Self::TransactionChecksumMismatch { .. }
        )
    }

    /// Returns the log position a corruption or log read error refers to.
    #[must_use]
    pub fn log_position(&self) -> Option<LogPosition> {
        match self {
            Self::LogRead { position, .. }
            | Self::CorruptLog { position, .. }
            | Self::ChecksumMismatch { position, .. }
            | Self::TransactionChecksumMismatch { position, .. } => Some(*position),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_checksum_keeps_position() {
        let position = LogPosition::new(2, 100);
        let err = CoreError::from_codec(
            CodecError::ChecksumMismatch {
                expected: 1,
                actual: 2,
            },
            position,
        );
        assert!(err.is_log_corruption());
        assert_eq!(err.log_position(), Some(position));
        assert!(err.to_string().contains("2:100"));
    }

    #[test]
    fn io_is_not_corruption() {
        let err = CoreError::from(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(!err.is_log_corruption());
        assert_eq!(err.log_position(), None);
    }

    #[test]
    fn log_read_is_positioned_but_not_corruption() {
        let position = LogPosition::new(3, 25);
        let err = CoreError::LogRead {
            position,
            source: trellis_storage::StorageError::ReadPastEnd {
                offset: 25,
                len: 64,
                size: 25,
            },
        };
        assert!(!err.is_log_corruption());
        assert_eq!(err.log_position(), Some(position));
        assert!(err.to_string().contains("3:25"));
    }
}
