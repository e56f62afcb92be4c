//! Positions in the logical transaction log.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An exact byte in the logical, version-spanning log stream.
///
/// `byte_offset` is relative to the start of the physical file for
/// `log_version`, header included. Positions order by version first,
/// then by offset.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    /// Version of the physical log file.
    pub log_version: u64,
    /// Offset within that file.
    pub byte_offset: u64,
}

impl LogPosition {
    /// Creates a new log position.
    #[must_use]
    pub const fn new(log_version: u64, byte_offset: u64) -> Self {
        Self {
            log_version,
            byte_offset,
        }
    }

    /// Returns the position `len` bytes further into the same file.
    #[must_use]
    pub const fn advance(self, len: u64) -> Self {
        Self::new(self.log_version, self.byte_offset + len)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_version, self.byte_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_version_then_offset() {
        let a = LogPosition::new(0, 900);
        let b = LogPosition::new(1, 25);
        let c = LogPosition::new(1, 26);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.advance(1), c);
    }

    #[test]
    fn display() {
        assert_eq!(LogPosition::new(3, 125).to_string(), "3:125");
    }
}
