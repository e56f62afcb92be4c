//! Transaction appender and group commit.

use crate::error::{CoreError, CoreResult};
use crate::log::files::LogFiles;
use crate::log::transaction::TransactionRepresentation;
use crate::types::{now_millis, TransactionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use trellis_codec::{encode_entry, LogEntry, LogPosition};

/// Forces the log on behalf of many waiters.
///
/// The first caller that finds its bytes not yet durable takes the force
/// lock and flushes everything written so far. Callers whose end position
/// that flush covered return without flushing again.
#[derive(Debug)]
pub struct LogForcer {
    files: Arc<LogFiles>,
    force_lock: Mutex<()>,
    window: Duration,
    forces: AtomicU64,
    failure: Mutex<Option<String>>,
}

impl LogForcer {
    /// Creates a forcer for `files`.
    ///
    /// A non-zero `window` makes the forcing thread wait that long before
    /// flushing, so that more commits can join the flush.
    pub fn new(files: Arc<LogFiles>, window: Duration) -> Self {
        Self {
            files,
            force_lock: Mutex::new(()),
            window,
            forces: AtomicU64::new(0),
            failure: Mutex::new(None),
        }
    }

    /// Blocks until everything before `end` is durable.
    ///
    /// # Errors
    ///
    /// Returns `LogUnhealthy` if this or an earlier flush failed.
    pub fn force_up_to(&self, end: LogPosition) -> CoreResult<()> {
        self.check_health()?;
        if self.files.durable_position() >= end {
            return Ok(());
        }

        let _guard = self.force_lock.lock();
        self.check_health()?;
        if self.files.durable_position() >= end {
            return Ok(());
        }

        if !self.window.is_zero() {
            std::thread::sleep(self.window);
        }

        match self.files.flush() {
            Ok(durable) => {
                self.forces.fetch_add(1, Ordering::Relaxed);
                debug!(%durable, "forced transaction log");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "transaction log flush failed");
                let message = err.to_string();
                *self.failure.lock() = Some(message.clone());
                Err(CoreError::LogUnhealthy { message })
            }
        }
    }

    /// Forces everything written so far.
    ///
    /// # Errors
    ///
    /// Returns `LogUnhealthy` if the flush fails.
    pub fn force(&self) -> CoreResult<()> {
        self.force_up_to(self.files.current_position())
    }

    /// Number of flushes performed.
    #[must_use]
    pub fn force_count(&self) -> u64 {
        self.forces.load(Ordering::Relaxed)
    }

    /// Returns false once a flush has failed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.failure.lock().is_none()
    }

    pub(crate) fn mark_unhealthy(&self, message: String) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message);
        }
    }

    fn check_health(&self) -> CoreResult<()> {
        match self.failure.lock().as_ref() {
            Some(message) => Err(CoreError::LogUnhealthy {
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Handle for an appended transaction.
///
/// The transaction is committed once [`Commitment::wait_until_durable`]
/// returns successfully.
#[derive(Debug, Clone)]
pub struct Commitment {
    transaction: TransactionId,
    start: LogPosition,
    end: LogPosition,
    forcer: Arc<LogForcer>,
}

impl Commitment {
    /// Blocks until the transaction's bytes are durable.
    ///
    /// # Errors
    ///
    /// Returns `LogUnhealthy` if the covering flush failed.
    pub fn wait_until_durable(&self) -> CoreResult<()> {
        self.forcer.force_up_to(self.end)
    }

    /// Returns true if the transaction's bytes are already durable.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.forcer.files.durable_position() >= self.end
    }

    /// Identity of the appended transaction.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction
    }

    /// Position of the transaction's start entry.
    #[must_use]
    pub fn position(&self) -> LogPosition {
        self.start
    }

    /// Position after the transaction's commit entry.
    #[must_use]
    pub fn end_position(&self) -> LogPosition {
        self.end
    }
}

struct AppenderState {
    last_assigned: u64,
}

/// Writes transactions to the log, one contiguous group at a time.
pub struct TransactionAppender {
    files: Arc<LogFiles>,
    state: Mutex<AppenderState>,
    forcer: Arc<LogForcer>,
}

impl TransactionAppender {
    /// Creates an appender continuing after `last_committed_tx_id`.
    pub fn new(files: Arc<LogFiles>, last_committed_tx_id: u64, group_commit_window: Duration) -> Self {
        let forcer = Arc::new(LogForcer::new(Arc::clone(&files), group_commit_window));
        Self {
            files,
            state: Mutex::new(AppenderState {
                last_assigned: last_committed_tx_id,
            }),
            forcer,
        }
    }

    /// Appends `tx`, which must carry the next transaction id.
    ///
    /// # Errors
    ///
    /// Returns `OutOfOrderTransaction` without writing anything if the id is
    /// not exactly one above the last appended id, `LogUnhealthy` after an
    /// earlier flush failure, or the write error.
    pub fn append(&self, tx: &TransactionRepresentation) -> CoreResult<Commitment> {
        let mut state = self.state.lock();
        let expected = state.last_assigned + 1;
        if tx.tx_id != expected {
            warn!(expected, actual = tx.tx_id, "rejecting out of order transaction");
            return Err(CoreError::OutOfOrderTransaction {
                expected,
                actual: tx.tx_id,
            });
        }
        self.write_locked(&mut state, tx)
    }

    /// Assigns the next transaction id to `tx` and appends it.
    ///
    /// # Errors
    ///
    /// Returns `LogUnhealthy` after an earlier flush failure, or the write error.
    pub fn append_next(&self, tx: &mut TransactionRepresentation) -> CoreResult<Commitment> {
        let mut state = self.state.lock();
        tx.tx_id = state.last_assigned + 1;
        self.write_locked(&mut state, tx)
    }

    fn write_locked(
        &self,
        state: &mut AppenderState,
        tx: &TransactionRepresentation,
    ) -> CoreResult<Commitment> {
        self.forcer.check_health()?;

        let commit_timestamp = now_millis();
        let checksum = tx.checksum(commit_timestamp);
        let mut buf = Vec::new();
        encode_entry(
            &LogEntry::Start {
                tx_id: tx.tx_id,
                last_committed_tx_id: state.last_assigned,
                timestamp: tx.timestamp,
                leader_term: tx.leader_term,
                additional_data: tx.additional_data.clone(),
            },
            &mut buf,
        )?;
        for command in &tx.commands {
            encode_entry(
                &LogEntry::Command {
                    payload: command.clone(),
                },
                &mut buf,
            )?;
        }
        encode_entry(
            &LogEntry::Commit {
                tx_id: tx.tx_id,
                timestamp: commit_timestamp,
                checksum,
            },
            &mut buf,
        )?;

        let (start, end) = match self.files.append(&buf) {
            Ok(range) => range,
            Err(err) => {
                // A partial write leaves the tail in an unknown state.
                self.forcer.mark_unhealthy(err.to_string());
                return Err(err);
            }
        };
        state.last_assigned = tx.tx_id;

        if self.files.should_rotate() {
            // The retired file is synced by the forcer, outside this lock.
            if let Err(err) = self.files.rotate(tx.tx_id) {
                self.forcer.mark_unhealthy(err.to_string());
                return Err(err);
            }
        }

        Ok(Commitment {
            transaction: TransactionId::new(tx.tx_id, checksum, commit_timestamp),
            start,
            end,
            forcer: Arc::clone(&self.forcer),
        })
    }

    /// Appends a checkpoint entry and forces it.
    ///
    /// Returns the positions of the entry and of the byte after it.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written or forced.
    pub fn append_checkpoint(&self, entry: &LogEntry) -> CoreResult<(LogPosition, LogPosition)> {
        let range = {
            let _state = self.state.lock();
            self.forcer.check_health()?;
            let bytes = entry.encode()?;
            self.files.append(&bytes)?
        };
        self.forcer.force_up_to(range.1)?;
        Ok(range)
    }

    /// Forces everything appended so far.
    ///
    /// # Errors
    ///
    /// Returns `LogUnhealthy` if the flush fails.
    pub fn force(&self) -> CoreResult<()> {
        self.forcer.force()
    }

    /// Last transaction id handed out.
    #[must_use]
    pub fn last_committed_tx_id(&self) -> u64 {
        self.state.lock().last_assigned
    }

    /// Number of flushes performed so far.
    #[must_use]
    pub fn force_count(&self) -> u64 {
        self.forcer.force_count()
    }

    /// Returns false once a flush or write has failed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.forcer.is_healthy()
    }

    /// The log files this appender writes to.
    #[must_use]
    pub fn files(&self) -> &Arc<LogFiles> {
        &self.files
    }
}

impl std::fmt::Debug for TransactionAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionAppender")
            .field("last_committed_tx_id", &self.last_committed_tx_id())
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}
