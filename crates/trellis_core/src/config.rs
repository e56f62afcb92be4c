//! Database configuration.

use crate::recovery::{CancellationToken, RecoveryCriteria};
use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Size at which the active log file is rotated.
    pub max_log_size: u64,

    /// How long the thread forcing the log waits for more commits to join
    /// its flush (zero = flush immediately).
    pub group_commit_window: Duration,

    /// Checkpoint after this many transactions (0 = only on demand).
    pub checkpoint_threshold_transactions: u64,

    /// Checkpoint after this many log bytes (0 = no size trigger).
    pub checkpoint_threshold_log_bytes: u64,

    /// Whether closing the database forces a checkpoint.
    pub checkpoint_on_close: bool,

    /// Whether a corrupt log aborts startup. When false, recovery stops at
    /// the last intact transaction and truncates the remainder.
    pub fail_on_corrupted_log: bool,

    /// Whether startup fails when the store has applied transactions but
    /// the log files are gone.
    pub fail_on_missing_logs: bool,

    /// Replay the log from the last checkpoint even if nothing is missing.
    pub force_recovery: bool,

    /// Recompute the counts store from the records during recovery.
    pub rebuild_counts: bool,

    /// Which transactions recovery replays.
    pub recovery_criteria: RecoveryCriteria,

    /// Cancels an in-progress recovery from another thread.
    pub recovery_cancellation: CancellationToken,

    /// Read buffer size for log cursors.
    pub read_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_log_size: 64 * 1024 * 1024, // 64 MB
            group_commit_window: Duration::ZERO,
            checkpoint_threshold_transactions: 0,
            checkpoint_threshold_log_bytes: 0,
            checkpoint_on_close: true,
            fail_on_corrupted_log: true,
            fail_on_missing_logs: true,
            force_recovery: false,
            rebuild_counts: false,
            recovery_criteria: RecoveryCriteria::All,
            recovery_cancellation: CancellationToken::default(),
            read_buffer_size: 64 * 1024,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the log rotation size.
    #[must_use]
    pub const fn max_log_size(mut self, size: u64) -> Self {
        self.max_log_size = size;
        self
    }

    /// Sets the group commit window.
    #[must_use]
    pub const fn group_commit_window(mut self, window: Duration) -> Self {
        self.group_commit_window = window;
        self
    }

    /// Sets the transaction-count checkpoint threshold.
    #[must_use]
    pub const fn checkpoint_threshold_transactions(mut self, count: u64) -> Self {
        self.checkpoint_threshold_transactions = count;
        self
    }

    /// Sets the log-size checkpoint threshold.
    #[must_use]
    pub const fn checkpoint_threshold_log_bytes(mut self, bytes: u64) -> Self {
        self.checkpoint_threshold_log_bytes = bytes;
        self
    }

    /// Sets whether closing forces a checkpoint.
    #[must_use]
    pub const fn checkpoint_on_close(mut self, value: bool) -> Self {
        self.checkpoint_on_close = value;
        self
    }

    /// Sets whether log corruption aborts startup.
    #[must_use]
    pub const fn fail_on_corrupted_log(mut self, value: bool) -> Self {
        self.fail_on_corrupted_log = value;
        self
    }

    /// Sets whether missing log files abort startup.
    #[must_use]
    pub const fn fail_on_missing_logs(mut self, value: bool) -> Self {
        self.fail_on_missing_logs = value;
        self
    }

    /// Sets whether recovery always replays from the last checkpoint.
    #[must_use]
    pub const fn force_recovery(mut self, value: bool) -> Self {
        self.force_recovery = value;
        self
    }

    /// Sets whether recovery rebuilds the counts store.
    #[must_use]
    pub const fn rebuild_counts(mut self, value: bool) -> Self {
        self.rebuild_counts = value;
        self
    }

    /// Sets the recovery criteria.
    #[must_use]
    pub const fn recovery_criteria(mut self, criteria: RecoveryCriteria) -> Self {
        self.recovery_criteria = criteria;
        self
    }

    /// Sets the token used to cancel recovery.
    #[must_use]
    pub fn recovery_cancellation(mut self, token: CancellationToken) -> Self {
        self.recovery_cancellation = token;
        self
    }

    /// Sets the log read buffer size.
    #[must_use]
    pub const fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.fail_on_corrupted_log);
        assert!(config.fail_on_missing_logs);
        assert!(!config.force_recovery);
        assert_eq!(config.recovery_criteria, RecoveryCriteria::All);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .max_log_size(4096)
            .fail_on_corrupted_log(false)
            .recovery_criteria(RecoveryCriteria::UntilTransaction(10))
            .checkpoint_threshold_transactions(100);

        assert_eq!(config.max_log_size, 4096);
        assert!(!config.fail_on_corrupted_log);
        assert_eq!(config.recovery_criteria, RecoveryCriteria::UntilTransaction(10));
        assert_eq!(config.checkpoint_threshold_transactions, 100);
    }
}
