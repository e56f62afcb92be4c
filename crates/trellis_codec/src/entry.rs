//! Log entry types.

use crate::position::LogPosition;
use std::fmt;

/// Type tag of a log entry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// Start of a transaction.
    Start = 1,
    /// One opaque storage-engine command.
    Command = 2,
    /// Commit of a transaction.
    Commit = 3,
    /// Checkpoint marker.
    Checkpoint = 4,
}

impl EntryType {
    /// Converts a byte to an entry type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Start),
            2 => Some(Self::Command),
            3 => Some(Self::Commit),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the entry type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "START",
            Self::Command => "COMMAND",
            Self::Commit => "COMMIT",
            Self::Checkpoint => "CHECKPOINT",
        };
        f.write_str(name)
    }
}

/// A single entry of the transaction log.
///
/// Every `Commit` for a transaction is preceded in the physical stream by
/// exactly one `Start` for the same transaction and zero or more `Command`s
/// belonging to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Start of a transaction.
    Start {
        /// Transaction id.
        tx_id: u64,
        /// Last transaction committed when this one was appended.
        last_committed_tx_id: u64,
        /// Wall-clock time in milliseconds.
        timestamp: u64,
        /// Leader term of the writer (0 outside a cluster and in legacy logs).
        leader_term: u64,
        /// Opaque caller-supplied bytes.
        additional_data: Vec<u8>,
    },

    /// One storage-engine command of the enclosing transaction.
    Command {
        /// Opaque command bytes owned by the storage engine.
        payload: Vec<u8>,
    },

    /// Commit of a transaction.
    Commit {
        /// Transaction id.
        tx_id: u64,
        /// Commit time in milliseconds.
        timestamp: u64,
        /// Checksum over the transaction contents (0 in legacy logs).
        checksum: u64,
    },

    /// Checkpoint marker.
    Checkpoint {
        /// Log position from which recovery has to replay.
        position: LogPosition,
        /// Last transaction whose effects the checkpoint made durable.
        last_tx_id: u64,
        /// Checkpoint time in milliseconds.
        timestamp: u64,
        /// What triggered the checkpoint.
        reason: String,
    },
}

impl LogEntry {
    /// Returns the entry type.
    #[must_use]
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Start { .. } => EntryType::Start,
            Self::Command { .. } => EntryType::Command,
            Self::Commit { .. } => EntryType::Commit,
            Self::Checkpoint { .. } => EntryType::Checkpoint,
        }
    }

    /// Returns the transaction id for `Start` and `Commit` entries.
    #[must_use]
    pub fn tx_id(&self) -> Option<u64> {
        match self {
            Self::Start { tx_id, .. } | Self::Commit { tx_id, .. } => Some(*tx_id),
            Self::Command { .. } | Self::Checkpoint { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_type_byte_roundtrip() {
        for ty in [
            EntryType::Start,
            EntryType::Command,
            EntryType::Commit,
            EntryType::Checkpoint,
        ] {
            assert_eq!(EntryType::from_byte(ty.as_byte()), Some(ty));
        }
        assert_eq!(EntryType::from_byte(0), None);
        assert_eq!(EntryType::from_byte(5), None);
    }

    #[test]
    fn tx_id_only_for_start_and_commit() {
        let commit = LogEntry::Commit {
            tx_id: 4,
            timestamp: 0,
            checksum: 0,
        };
        let command = LogEntry::Command {
            payload: vec![1, 2],
        };
        assert_eq!(commit.tx_id(), Some(4));
        assert_eq!(command.tx_id(), None);
        assert_eq!(commit.entry_type().to_string(), "COMMIT");
    }
}
