//! Startup recovery.
//!
//! Recovery runs once, single threaded, before the log is opened for
//! writing. It moves through `NotChecked -> Checking -> {NotNeeded |
//! Recovering} -> Done`:
//!
//! - **Checking** finds the last checkpoint, scans forward to the last
//!   complete transaction and compares it with what the storage engine has
//!   applied.
//! - **Recovering** replays every complete transaction after the checkpoint
//!   in [`ApplyMode::Recovery`], reconciles the counts store and truncates
//!   the log at the end of the last transaction kept.
//! - **Done** forces a `"recovery completed"` checkpoint if anything was
//!   replayed.

mod cancel;
mod counts;
mod criteria;
mod monitor;
mod tail;

pub use cancel::CancellationToken;
pub use counts::{CountsOutcome, CountsRecovery};
pub use criteria::RecoveryCriteria;
pub use monitor::{LoggingMonitor, RecoveryMonitor};
pub use tail::{find_last_checkpoint, LogTail};

use crate::checkpoint::{CheckpointRecord, Checkpointer};
use crate::config::Config;
use crate::engine::{ApplyMode, CommandBatch, StorageEngine};
use crate::error::{CoreError, CoreResult};
use crate::log::{read_transactions, LogFiles};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use trellis_codec::LogPosition;

/// Where recovery is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Nothing has been looked at yet.
    NotChecked,
    /// Scanning the log.
    Checking,
    /// The store is consistent with the log.
    NotNeeded,
    /// Transactions must be replayed.
    Recovering,
    /// Recovery is over and the log may be opened for writing.
    Done,
}

/// Whether anything had to be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryOutcome {
    /// The store was already current.
    #[default]
    NotNeeded,
    /// Transactions were replayed or the counts were reconciled.
    Recovered,
}

/// Summary of a recovery run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Whether recovery did anything.
    pub outcome: RecoveryOutcome,
    /// Number of transactions applied to the engine.
    pub replayed_transactions: u64,
    /// First replayed transaction id.
    pub first_replayed_tx_id: Option<u64>,
    /// Last replayed transaction id.
    pub last_replayed_tx_id: Option<u64>,
    /// Where replay started.
    pub replay_from: LogPosition,
    /// End of the last transaction kept in the log.
    pub replay_to: LogPosition,
    /// Highest committed transaction id after recovery.
    pub last_committed_tx_id: u64,
    /// Where the log was cut, if bytes were removed.
    pub truncated_at: Option<LogPosition>,
    /// Tolerated corruption that ended the log early.
    pub corruption: Option<String>,
    /// True if the recovery criteria ended replay.
    pub stopped_by_criteria: bool,
    /// How the counts store was brought up to date.
    pub counts: Option<CountsOutcome>,
    /// Wall time from the start of checking to completion.
    pub elapsed: Duration,
}

/// Drives recovery of a storage engine from the transaction log.
pub struct RecoveryOrchestrator<'a> {
    files: &'a LogFiles,
    engine: &'a dyn StorageEngine,
    config: &'a Config,
    monitor: &'a dyn RecoveryMonitor,
    phase: RecoveryPhase,
    tail: Option<LogTail>,
    rebuild_counts: bool,
    report: RecoveryReport,
    started: Instant,
}

impl<'a> RecoveryOrchestrator<'a> {
    /// Creates an orchestrator over inactive log files.
    pub fn new(
        files: &'a LogFiles,
        engine: &'a dyn StorageEngine,
        config: &'a Config,
        monitor: &'a dyn RecoveryMonitor,
    ) -> Self {
        Self {
            files,
            engine,
            config,
            monitor,
            phase: RecoveryPhase::NotChecked,
            tail: None,
            rebuild_counts: false,
            report: RecoveryReport::default(),
            started: Instant::now(),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// What the last scan found, once checked.
    #[must_use]
    pub fn tail(&self) -> Option<&LogTail> {
        self.tail.as_ref()
    }

    /// Scans the log and decides whether replay is needed.
    ///
    /// # Errors
    ///
    /// Returns `MissingLogs` if the engine has applied transactions but the
    /// log is gone, or `RecoveryFailed` wrapping a read or corruption error.
    pub fn check(&mut self) -> CoreResult<bool> {
        if self.phase != RecoveryPhase::NotChecked {
            return Err(CoreError::invalid_operation("recovery has already been checked"));
        }
        self.phase = RecoveryPhase::Checking;
        self.started = Instant::now();

        let engine_last = self.engine.last_applied_transaction_id();
        let tolerate = !self.config.fail_on_corrupted_log;
        let mut tail = LogTail::scan(self.files, tolerate)
            .map_err(|e| recovery_failed(e, LogPosition::default(), engine_last))?;

        if tail.is_empty() && engine_last > 0 {
            if self.config.fail_on_missing_logs {
                return Err(CoreError::MissingLogs {
                    last_applied_tx_id: engine_last,
                });
            }
            warn!(
                last_applied_tx_id = engine_last,
                "no transaction logs found, starting a new log after the store's last transaction"
            );
        }

        let mut rebuild = self.config.rebuild_counts;
        let checkpoint_last = tail.last_checkpoint.as_ref().map_or(0, |c| c.last_tx_id);
        if engine_last < checkpoint_last {
            warn!(
                engine_last,
                checkpoint_last, "store is behind the last checkpoint, replaying the whole log"
            );
            tail = LogTail::scan_all(self.files, tolerate)
                .map_err(|e| recovery_failed(e, LogPosition::default(), engine_last))?;
            rebuild = true;
        }

        let counts = self.engine.counts_state();
        if counts.tx_id < checkpoint_last {
            rebuild = true;
        }

        let log_last = tail.last_committed_tx_id;
        let required = self.config.force_recovery
            || rebuild
            || !counts.consistent
            || log_last > engine_last
            || counts.tx_id < log_last
            || (!self.config.recovery_criteria.is_all() && tail.transactions_after_checkpoint > 0);

        self.report.replay_from = tail.replay_from;
        self.report.replay_to = tail.valid_end;
        self.report.last_committed_tx_id = engine_last.max(log_last);
        self.report.corruption = tail.corruption.as_ref().map(ToString::to_string);
        self.rebuild_counts = rebuild;
        self.tail = Some(tail);
        self.phase = if required {
            RecoveryPhase::Recovering
        } else {
            RecoveryPhase::NotNeeded
        };
        Ok(required)
    }

    /// Replays the log if [`RecoveryOrchestrator::check`] found it necessary
    /// and cuts off anything past the last transaction kept.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the cancellation token fires,
    /// `RecoveryCriteriaUnsatisfiable` if the criteria reject a transaction
    /// the engine already holds, or `RecoveryFailed` for read, corruption
    /// and apply failures.
    pub fn recover(&mut self) -> CoreResult<()> {
        if self.phase == RecoveryPhase::NotChecked {
            self.check()?;
        }
        let Some(tail) = self.tail.take() else {
            return Err(CoreError::invalid_operation("recovery has not been checked"));
        };
        let result = match self.phase {
            RecoveryPhase::NotNeeded => self.truncate_tail(&tail, tail.valid_end, false),
            RecoveryPhase::Recovering => self.replay(&tail),
            _ => Err(CoreError::invalid_operation("recovery has already run")),
        };
        self.tail = Some(tail);
        result
    }

    fn replay(&mut self, tail: &LogTail) -> CoreResult<()> {
        let from = tail.replay_from;
        self.monitor.recovery_required(from);
        self.report.outcome = RecoveryOutcome::Recovered;

        let engine_last = self.engine.last_applied_transaction_id();
        let criteria = self.config.recovery_criteria;
        let tolerate = !self.config.fail_on_corrupted_log;
        let mut counts = CountsRecovery::new(self.engine.counts_state(), self.rebuild_counts);

        let mut stream =
            read_transactions(self.files, from).map_err(|e| recovery_failed(e, from, engine_last))?;
        let mut last_end = None;
        let mut last_tx_id = engine_last;
        let mut rejected = None;
        let mut replayed = 0;
        loop {
            if self.config.recovery_cancellation.is_cancelled() {
                warn!(last_tx_id, "recovery cancelled");
                return Err(CoreError::Cancelled);
            }
            let Some(next) = stream.next() else {
                break;
            };
            let tx = match next {
                Ok(tx) => tx,
                Err(err) if tolerate && err.is_log_corruption() => {
                    warn!(error = %err, "stopping replay at log corruption");
                    self.report.corruption = Some(err.to_string());
                    break;
                }
                Err(err) => {
                    return Err(recovery_failed(err, last_end.unwrap_or(from), last_tx_id));
                }
            };

            if tx.tx_id <= tail.covered_tx_id {
                last_end = Some(tx.end_position);
                continue;
            }

            if !criteria.accepts(&tx) {
                if tx.tx_id <= engine_last {
                    return Err(CoreError::RecoveryCriteriaUnsatisfiable {
                        message: format!(
                            "{criteria} excludes transaction {}, which the store has already applied",
                            tx.tx_id
                        ),
                    });
                }
                info!(tx_id = tx.tx_id, %criteria, "recovery stopped by criteria");
                rejected = Some(tx.tx_id);
                break;
            }

            let batch = CommandBatch {
                tx_id: tx.tx_id,
                timestamp: tx.start_timestamp,
                commands: &tx.commands,
            };
            let delta = self
                .engine
                .apply(&batch, ApplyMode::Recovery)
                .map_err(|source| {
                    recovery_failed(
                        CoreError::Apply {
                            tx_id: tx.tx_id,
                            position: tx.commit_position,
                            source,
                        },
                        tx.start_position,
                        last_tx_id,
                    )
                })?;
            counts.record(tx.tx_id, &delta);
            self.monitor.transaction_recovered(&tx);

            replayed += 1;
            self.report.first_replayed_tx_id.get_or_insert(tx.tx_id);
            self.report.last_replayed_tx_id = Some(tx.tx_id);
            last_tx_id = last_tx_id.max(tx.tx_id);
            last_end = Some(tx.end_position);
        }
        self.report.replayed_transactions = replayed;
        info!(count = replayed, "recovery replayed {} transactions", replayed);

        let counts_outcome = counts
            .finish(self.engine)
            .map_err(|e| recovery_failed(e, last_end.unwrap_or(from), last_tx_id))?;
        self.report.counts = Some(counts_outcome);

        let stopped = rejected.is_some();
        self.report.stopped_by_criteria = stopped;
        let cut = match rejected {
            Some(rejected_tx_id) => {
                let mut at = last_end.unwrap_or(from);
                if let Some(checkpoint) = &tail.last_checkpoint {
                    if checkpoint.last_tx_id < rejected_tx_id && checkpoint.entry_end > at {
                        at = checkpoint.entry_end;
                    }
                }
                at
            }
            None => tail.valid_end,
        };
        self.truncate_tail(tail, cut, stopped)?;

        let engine_after = self.engine.last_applied_transaction_id();
        self.report.last_committed_tx_id = if stopped || self.report.corruption.is_some() {
            engine_after
        } else {
            engine_after.max(tail.last_committed_tx_id)
        };
        Ok(())
    }

    fn truncate_tail(&mut self, tail: &LogTail, at: LogPosition, stopped: bool) -> CoreResult<()> {
        let discards = stopped
            || tail.torn_tail.is_some()
            || tail.incomplete_tail.is_some()
            || self.report.corruption.is_some();
        if tail.is_empty() {
            return Ok(());
        }
        self.files
            .truncate(at)
            .map_err(|e| recovery_failed(e, at, self.report.last_committed_tx_id))?;
        self.report.replay_to = at;
        if discards {
            warn!(position = %at, "discarded log contents after the last kept transaction");
            self.report.truncated_at = Some(at);
        }
        Ok(())
    }

    /// Highest committed transaction id; the appender continues after it.
    #[must_use]
    pub fn last_committed_tx_id(&self) -> u64 {
        self.report.last_committed_tx_id
    }

    /// The log's last checkpoint if it still describes the store, so that
    /// an immediate checkpoint with nothing new is a no-op.
    #[must_use]
    pub fn last_checkpoint_if_current(&self) -> Option<CheckpointRecord> {
        if self.report.outcome == RecoveryOutcome::Recovered {
            return None;
        }
        self.tail
            .as_ref()
            .and_then(|tail| tail.last_checkpoint.clone())
            .filter(|checkpoint| {
                checkpoint.last_tx_id == self.report.last_committed_tx_id
                    && checkpoint.entry_end <= self.report.replay_to
            })
    }

    /// Finishes recovery, checkpointing if anything was replayed.
    ///
    /// # Errors
    ///
    /// Returns an error if the recovery checkpoint fails.
    pub fn complete(&mut self, checkpointer: &Checkpointer) -> CoreResult<()> {
        if !matches!(self.phase, RecoveryPhase::NotNeeded | RecoveryPhase::Recovering) {
            return Err(CoreError::invalid_operation("recovery has not run"));
        }
        let recovered = self.report.outcome == RecoveryOutcome::Recovered;
        if recovered {
            checkpointer.force_checkpoint("recovery completed")?;
        }
        self.report.elapsed = self.started.elapsed();
        self.phase = RecoveryPhase::Done;
        if recovered {
            self.monitor.recovery_completed(&self.report);
        } else {
            self.monitor.no_recovery_needed();
        }
        Ok(())
    }

    /// The report so far.
    #[must_use]
    pub fn report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Consumes the orchestrator, returning its report.
    #[must_use]
    pub fn into_report(self) -> RecoveryReport {
        self.report
    }
}

impl std::fmt::Debug for RecoveryOrchestrator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("phase", &self.phase)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

fn recovery_failed(source: CoreError, position: LogPosition, last_tx_id: u64) -> CoreError {
    match source {
        CoreError::Cancelled
        | CoreError::MissingLogs { .. }
        | CoreError::RecoveryCriteriaUnsatisfiable { .. }
        | CoreError::RecoveryFailed { .. } => source,
        other => CoreError::RecoveryFailed {
            position: other.log_position().unwrap_or(position),
            last_tx_id,
            source: Box::new(other),
        },
    }
}
