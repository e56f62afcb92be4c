//! Legacy log migration.
//!
//! Legacy files interleave the entries of concurrent transactions and carry
//! no frame or commit checksums. The migrator rewrites each legacy file in
//! the current format:
//!
//! - entries are read through a [`ReorderingCursor`], so every transaction
//!   is written contiguously in commit order
//! - commit entries get their transaction checksum
//! - checkpoint positions are mapped into the rewritten layout
//!
//! The rewritten file is decoded again before it replaces the original,
//! which the store keeps as `<name>.legacy`.
//!
//! ## Usage
//!
//! ```ignore
//! use trellis_core::{FileLogStore, LegacyLogMigrator};
//! use std::sync::Arc;
//!
//! let store = Arc::new(FileLogStore::new("db/logs")?);
//! let report = LegacyLogMigrator::new(store).migrate()?;
//! println!("migrated {:?}", report.migrated_versions);
//! ```

use crate::error::{CoreError, CoreResult};
use crate::log::files::read_header;
use crate::log::{
    transaction_checksum, LogEntryCursor, LogFiles, LogStore, MemoryLogStore, ReorderingCursor,
    TransactionCursor,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use trellis_codec::{encode_entry, FormatVersion, LogEntry, LogHeader, LogPosition};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Result of a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions that were rewritten.
    pub migrated_versions: Vec<u64>,
    /// Committed transactions carried over.
    pub transactions: u64,
    /// Checkpoints carried over.
    pub checkpoints: u64,
    /// Uncommitted transactions left behind.
    pub discarded_transactions: u64,
}

/// Rewrites legacy-format log files in the current format.
#[derive(Debug)]
pub struct LegacyLogMigrator {
    store: Arc<dyn LogStore>,
    allow_incomplete_tail: bool,
}

struct Rewritten {
    bytes: Vec<u8>,
    transactions: u64,
    checkpoints: u64,
    discarded: u64,
}

struct OpenTransaction {
    tx_id: u64,
    timestamp: u64,
    commands: Vec<Vec<u8>>,
}

impl LegacyLogMigrator {
    /// Creates a migrator over `store`.
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            allow_incomplete_tail: false,
        }
    }

    /// Lets migration drop transactions that never committed.
    #[must_use]
    pub fn allow_incomplete_tail(mut self, allow: bool) -> Self {
        self.allow_incomplete_tail = allow;
        self
    }

    /// Versions whose header marks them as legacy format.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed or a header is damaged.
    pub fn legacy_versions(&self) -> CoreResult<Vec<u64>> {
        let mut legacy = Vec::new();
        for version in self.store.versions()? {
            if let Some(header) = read_header(self.store.as_ref(), version)? {
                if header.format_version == FormatVersion::Legacy {
                    legacy.push(version);
                }
            }
        }
        Ok(legacy)
    }

    /// Migrates every legacy file.
    ///
    /// Files are processed oldest first; a failure leaves every file not yet
    /// replaced untouched.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` if a file holds an uncommitted transaction
    /// and incomplete tails are not allowed, or if a rewritten file does not
    /// verify. Corruption in a legacy file is returned as is.
    pub fn migrate(&self) -> CoreResult<MigrationReport> {
        let mut report = MigrationReport::default();
        for version in self.legacy_versions()? {
            let Some(header) = read_header(self.store.as_ref(), version)? else {
                continue;
            };
            let rewritten = self.rewrite(version, &header)?;
            if rewritten.discarded > 0 {
                if !self.allow_incomplete_tail {
                    return Err(CoreError::migration_failed(format!(
                        "{} ends with {} uncommitted transaction(s)",
                        self.store.describe(version),
                        rewritten.discarded
                    )));
                }
                warn!(
                    version,
                    discarded = rewritten.discarded,
                    "dropping uncommitted legacy transactions"
                );
            }

            verify(version, &rewritten)?;
            self.store.replace(version, &rewritten.bytes)?;
            info!(
                version,
                transactions = rewritten.transactions,
                checkpoints = rewritten.checkpoints,
                "migrated legacy log file"
            );

            report.migrated_versions.push(version);
            report.transactions += rewritten.transactions;
            report.checkpoints += rewritten.checkpoints;
            report.discarded_transactions += rewritten.discarded;
        }
        Ok(report)
    }

    fn rewrite(&self, version: u64, header: &LogHeader) -> CoreResult<Rewritten> {
        let cursor = LogEntryCursor::single_version(Arc::clone(&self.store), version, READ_BUFFER_SIZE)?;
        let mut entries = ReorderingCursor::new(cursor);

        let mut bytes = LogHeader::current(version, header.last_committed_tx_id).encode();
        let mut open: Option<OpenTransaction> = None;
        let mut transactions = 0;
        let mut checkpoints = 0;

        for entry in entries.by_ref() {
            let entry = entry?;
            let rewritten = match &entry.entry {
                LogEntry::Start {
                    tx_id, timestamp, ..
                } => {
                    open = Some(OpenTransaction {
                        tx_id: *tx_id,
                        timestamp: *timestamp,
                        commands: Vec::new(),
                    });
                    entry.entry.clone()
                }
                LogEntry::Command { payload } => {
                    let Some(tx) = open.as_mut() else {
                        return Err(CoreError::corrupt_log(entry.position, "command outside a transaction"));
                    };
                    tx.commands.push(payload.clone());
                    entry.entry.clone()
                }
                LogEntry::Commit {
                    tx_id, timestamp, ..
                } => {
                    let tx = match open.take() {
                        Some(tx) if tx.tx_id == *tx_id => tx,
                        _ => {
                            return Err(CoreError::corrupt_log(
                                entry.position,
                                format!("commit of transaction {tx_id} does not match its start"),
                            ))
                        }
                    };
                    transactions += 1;
                    LogEntry::Commit {
                        tx_id: *tx_id,
                        timestamp: *timestamp,
                        checksum: transaction_checksum(
                            tx.tx_id,
                            tx.timestamp,
                            *timestamp,
                            &tx.commands,
                        ),
                    }
                }
                LogEntry::Checkpoint {
                    position,
                    last_tx_id,
                    timestamp,
                    reason,
                } => {
                    let here = LogPosition::new(version, bytes.len() as u64);
                    let mapped = if position.log_version < version {
                        LogFiles::first_entry_position(position.log_version)
                    } else {
                        here
                    };
                    debug!(from = %position, to = %mapped, "remapped checkpoint position");
                    checkpoints += 1;
                    LogEntry::Checkpoint {
                        position: mapped,
                        last_tx_id: *last_tx_id,
                        timestamp: *timestamp,
                        reason: reason.clone(),
                    }
                }
            };
            encode_entry(&rewritten, &mut bytes)?;
        }

        let torn = entries.inner().torn_tail().is_some();
        if torn {
            debug!(version, "legacy file ends in a torn entry");
        }
        Ok(Rewritten {
            bytes,
            transactions,
            checkpoints,
            discarded: entries.discarded() as u64 + u64::from(torn),
        })
    }
}

fn verify(version: u64, rewritten: &Rewritten) -> CoreResult<()> {
    let probe = MemoryLogStore::new();
    probe.insert(version, rewritten.bytes.clone());
    let cursor = LogEntryCursor::single_version(Arc::new(probe), version, READ_BUFFER_SIZE)?;
    let mut transactions = TransactionCursor::new(ReorderingCursor::new(cursor));

    let mut count = 0;
    for tx in transactions.by_ref() {
        tx.map_err(|e| {
            CoreError::migration_failed(format!("rewritten version {version} does not verify: {e}"))
        })?;
        count += 1;
    }
    if count != rewritten.transactions
        || transactions.incomplete_tail().is_some()
        || transactions.inner().inner().torn_tail().is_some()
    {
        return Err(CoreError::migration_failed(format!(
            "rewritten version {version} holds {count} of {} transactions",
            rewritten.transactions
        )));
    }
    Ok(())
}
