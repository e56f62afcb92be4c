//! Point-in-time recovery criteria.

use crate::log::CommittedTransaction;
use std::fmt;

/// Which logged transactions recovery replays.
///
/// Replay stops at the first transaction the criteria reject; that
/// transaction and everything after it is removed from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryCriteria {
    /// Replay everything.
    #[default]
    All,
    /// Replay transactions with an id below the given one.
    UntilTransaction(u64),
    /// Replay transactions committed before the given time (milliseconds).
    UntilTimestamp(u64),
}

impl RecoveryCriteria {
    /// Returns true if `tx` should be replayed.
    #[must_use]
    pub fn accepts(&self, tx: &CommittedTransaction) -> bool {
        match *self {
            Self::All => true,
            Self::UntilTransaction(limit) => tx.tx_id < limit,
            Self::UntilTimestamp(limit) => tx.commit_timestamp < limit,
        }
    }

    /// Returns true for [`RecoveryCriteria::All`].
    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl fmt::Display for RecoveryCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all transactions"),
            Self::UntilTransaction(id) => write!(f, "transactions before {id}"),
            Self::UntilTimestamp(ts) => write!(f, "transactions committed before {ts}"),
        }
    }
}
