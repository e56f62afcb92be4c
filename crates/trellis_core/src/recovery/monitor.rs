//! Recovery progress callbacks.

use crate::log::CommittedTransaction;
use crate::recovery::RecoveryReport;
use tracing::{debug, info};
use trellis_codec::LogPosition;

/// Observes a recovery run.
pub trait RecoveryMonitor: Send + Sync {
    /// Replay is about to start at `from`.
    fn recovery_required(&self, from: LogPosition);

    /// `tx` was applied to the storage engine.
    fn transaction_recovered(&self, tx: &CommittedTransaction);

    /// Recovery finished.
    fn recovery_completed(&self, report: &RecoveryReport);

    /// The store was already consistent with the log.
    fn no_recovery_needed(&self);
}

/// Reports recovery through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMonitor;

impl RecoveryMonitor for LoggingMonitor {
    fn recovery_required(&self, from: LogPosition) {
        info!(%from, "recovery started");
    }

    fn transaction_recovered(&self, tx: &CommittedTransaction) {
        debug!(tx_id = tx.tx_id, position = %tx.commit_position, "recovered transaction");
    }

    fn recovery_completed(&self, report: &RecoveryReport) {
        info!(
            replayed = report.replayed_transactions,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "recovery completed"
        );
    }

    fn no_recovery_needed(&self) {
        debug!("no recovery needed");
    }
}
