//! Checkpointing.
//!
//! A checkpoint makes the storage engine durable up to the current end of
//! the log and records that position in a `Checkpoint` entry. Recovery
//! never replays anything before the last checkpoint's position.

use crate::engine::StorageEngine;
use crate::error::CoreResult;
use crate::log::{PositionedEntry, TransactionAppender};
use crate::types::now_millis;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trellis_codec::{LogEntry, LogPosition};

/// A checkpoint entry and where it sits in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Position recovery replays from.
    pub position: LogPosition,
    /// Last transaction made durable by the checkpoint.
    pub last_tx_id: u64,
    /// Checkpoint time in milliseconds.
    pub timestamp: u64,
    /// What triggered it.
    pub reason: String,
    /// Position of the checkpoint entry itself.
    pub entry_position: LogPosition,
    /// Position after the checkpoint entry.
    pub entry_end: LogPosition,
}

impl CheckpointRecord {
    /// Extracts the record from a checkpoint entry read from the log.
    #[must_use]
    pub fn from_entry(entry: &PositionedEntry) -> Option<Self> {
        match &entry.entry {
            LogEntry::Checkpoint {
                position,
                last_tx_id,
                timestamp,
                reason,
            } => Some(Self {
                position: *position,
                last_tx_id: *last_tx_id,
                timestamp: *timestamp,
                reason: reason.clone(),
                entry_position: entry.position,
                entry_end: entry.end,
            }),
            _ => None,
        }
    }
}

/// Decides when enough has been written to warrant a checkpoint.
///
/// A limit of zero disables that trigger.
#[derive(Debug, Default)]
pub struct CheckpointThreshold {
    max_transactions: u64,
    max_log_bytes: u64,
    transactions: AtomicU64,
    bytes: AtomicU64,
}

impl CheckpointThreshold {
    /// Creates a threshold.
    #[must_use]
    pub fn new(max_transactions: u64, max_log_bytes: u64) -> Self {
        Self {
            max_transactions,
            max_log_bytes,
            transactions: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Counts one committed transaction of `bytes` log bytes.
    ///
    /// Returns true once either limit is reached.
    pub fn record(&self, bytes: u64) -> bool {
        let transactions = self.transactions.fetch_add(1, Ordering::Relaxed) + 1;
        let written = self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        (self.max_transactions > 0 && transactions >= self.max_transactions)
            || (self.max_log_bytes > 0 && written >= self.max_log_bytes)
    }

    /// Starts counting again.
    pub fn reset(&self) {
        self.transactions.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

/// Forces checkpoints, excluding commits while doing so.
///
/// Commits hold [`Checkpointer::commit_guard`] from append until the
/// engine has applied them. A checkpoint takes the same lock exclusively,
/// so the engine state it flushes covers exactly the transactions before
/// the position it records.
pub struct Checkpointer {
    lock: RwLock<()>,
    appender: Arc<TransactionAppender>,
    engine: Arc<dyn StorageEngine>,
    last: Mutex<Option<CheckpointRecord>>,
    threshold: CheckpointThreshold,
}

impl Checkpointer {
    /// Creates a checkpointer. `last` is the newest checkpoint already in
    /// the log, if it is still current.
    pub fn new(
        appender: Arc<TransactionAppender>,
        engine: Arc<dyn StorageEngine>,
        last: Option<CheckpointRecord>,
        threshold: CheckpointThreshold,
    ) -> Self {
        Self {
            lock: RwLock::new(()),
            appender,
            engine,
            last: Mutex::new(last),
            threshold,
        }
    }

    /// Shared guard held by a commit.
    pub fn commit_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Forces a checkpoint and returns the position it records.
    ///
    /// If nothing was committed since the last checkpoint, that
    /// checkpoint's position is returned and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or the engine cannot be made durable.
    /// No checkpoint entry is written in that case.
    pub fn force_checkpoint(&self, reason: &str) -> CoreResult<LogPosition> {
        let _exclusive = self.lock.write();
        self.checkpoint_locked(reason)
    }

    /// Like [`Checkpointer::force_checkpoint`], but gives up if the lock
    /// cannot be taken within `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Checkpointer::force_checkpoint`].
    pub fn try_checkpoint(&self, reason: &str, timeout: Duration) -> CoreResult<Option<LogPosition>> {
        let Some(_exclusive) = self.lock.try_write_for(timeout) else {
            debug!(reason, ?timeout, "checkpoint lock not available");
            return Ok(None);
        };
        self.checkpoint_locked(reason).map(Some)
    }

    fn checkpoint_locked(&self, reason: &str) -> CoreResult<LogPosition> {
        let last_tx_id = self.appender.last_committed_tx_id();
        if let Some(last) = self.last.lock().as_ref() {
            if last.last_tx_id == last_tx_id {
                debug!(position = %last.position, reason, "nothing committed since last checkpoint");
                return Ok(last.position);
            }
        }

        self.appender.force()?;
        if let Err(err) = self.engine.flush_and_force() {
            warn!(error = %err, reason, "storage engine flush failed, checkpoint not written");
            return Err(err);
        }

        let position = self.appender.files().current_position();
        let timestamp = now_millis();
        let entry = LogEntry::Checkpoint {
            position,
            last_tx_id,
            timestamp,
            reason: reason.to_string(),
        };
        let (entry_position, entry_end) = self.appender.append_checkpoint(&entry)?;
        info!(%position, last_tx_id, reason, "checkpoint completed");

        *self.last.lock() = Some(CheckpointRecord {
            position,
            last_tx_id,
            timestamp,
            reason: reason.to_string(),
            entry_position,
            entry_end,
        });
        self.threshold.reset();
        Ok(position)
    }

    /// Counts a commit of `bytes` log bytes; returns true if a checkpoint is due.
    pub fn record_commit(&self, bytes: u64) -> bool {
        self.threshold.record(bytes)
    }

    /// The newest checkpoint.
    #[must_use]
    pub fn last_checkpoint(&self) -> Option<CheckpointRecord> {
        self.last.lock().clone()
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("last", &self.last_checkpoint())
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}
