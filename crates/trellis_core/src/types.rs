//! Core type definitions for Trellis.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Transaction id preceding the first real transaction.
pub const BASE_TX_ID: u64 = 0;

/// Identity of a committed transaction.
///
/// Transaction ids are assigned densely: every id is exactly one above the
/// previously appended one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId {
    /// Transaction id.
    pub id: u64,
    /// Checksum over the transaction contents, as stored in its commit entry.
    pub checksum: u64,
    /// Commit time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl TransactionId {
    /// Creates a new transaction identity.
    #[must_use]
    pub const fn new(id: u64, checksum: u64, timestamp: u64) -> Self {
        Self {
            id,
            checksum,
            timestamp,
        }
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx:{}", self.id)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
