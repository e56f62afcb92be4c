//! Locating the last checkpoint and the end of the committed log.

use crate::checkpoint::CheckpointRecord;
use super::recovery_failed;
use crate::error::{CoreError, CoreResult};
use crate::log::{read_transactions, LogFiles};
use tracing::{debug, warn};
use trellis_codec::{FormatVersion, LogPosition};

/// What a scan of the log found.
#[derive(Debug)]
pub struct LogTail {
    /// Log versions present.
    pub versions: Vec<u64>,
    /// Newest checkpoint in the log.
    pub last_checkpoint: Option<CheckpointRecord>,
    /// Where replay starts.
    pub replay_from: LogPosition,
    /// Transactions up to this id found after `replay_from` are already
    /// covered by the checkpoint. Non-zero only when a legacy file is read
    /// from its start because its checkpoint split an open transaction.
    pub covered_tx_id: u64,
    /// Complete transactions from `replay_from` onwards.
    pub transactions_after_checkpoint: u64,
    /// Id of the first of those transactions.
    pub first_tx_after_checkpoint: Option<u64>,
    /// Highest committed transaction id the log knows of.
    pub last_committed_tx_id: u64,
    /// End of the last complete transaction or checkpoint.
    pub valid_end: LogPosition,
    /// Where a torn frame was found.
    pub torn_tail: Option<LogPosition>,
    /// Start of a transaction cut off before its commit.
    pub incomplete_tail: Option<LogPosition>,
    /// Corruption that ended the scan, when tolerated.
    pub corruption: Option<CoreError>,
}

impl LogTail {
    /// Scans the log from its last checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryFailed` naming the failing log position and the
    /// last transaction confirmed before it, for read errors and for
    /// corruption unless `tolerate_corruption` is set.
    pub fn scan(files: &LogFiles, tolerate_corruption: bool) -> CoreResult<Self> {
        let versions = files.versions()?;
        let last_checkpoint = find_last_checkpoint(files, &versions)?;
        let (replay_from, covered_tx_id) = match &last_checkpoint {
            Some(checkpoint) => replay_start(files, checkpoint)?,
            None => (start_of_log(&versions), 0),
        };
        Self::scan_from(
            files,
            versions,
            last_checkpoint,
            replay_from,
            covered_tx_id,
            tolerate_corruption,
        )
    }

    /// Scans the whole log, ignoring checkpoints as replay starting points.
    ///
    /// # Errors
    ///
    /// See [`LogTail::scan`].
    pub fn scan_all(files: &LogFiles, tolerate_corruption: bool) -> CoreResult<Self> {
        let versions = files.versions()?;
        let last_checkpoint = find_last_checkpoint(files, &versions)?;
        let replay_from = start_of_log(&versions);
        Self::scan_from(files, versions, last_checkpoint, replay_from, 0, tolerate_corruption)
    }

    fn scan_from(
        files: &LogFiles,
        versions: Vec<u64>,
        last_checkpoint: Option<CheckpointRecord>,
        replay_from: LogPosition,
        covered_tx_id: u64,
        tolerate_corruption: bool,
    ) -> CoreResult<Self> {
        let header_last = newest_header_last_committed(files, &versions)?;

        let checkpoint_last = last_checkpoint.as_ref().map_or(0, |c| c.last_tx_id);
        let mut stream = read_transactions(files, replay_from)
            .map_err(|e| recovery_failed(e, replay_from, checkpoint_last))?;
        let mut count = 0;
        let mut first = None;
        let mut last = None;
        let mut corruption = None;
        while let Some(tx) = stream.next() {
            match tx {
                Ok(tx) => {
                    last = Some(last.map_or(tx.tx_id, |l: u64| l.max(tx.tx_id)));
                    if tx.tx_id > covered_tx_id {
                        count += 1;
                        first.get_or_insert(tx.tx_id);
                    }
                }
                Err(err) if tolerate_corruption && err.is_log_corruption() => {
                    warn!(error = %err, "log corruption, recovering up to the last intact transaction");
                    corruption = Some(err);
                    break;
                }
                Err(err) => {
                    let reached = stream.last_end().unwrap_or(replay_from);
                    let confirmed = last.unwrap_or(0).max(checkpoint_last);
                    return Err(recovery_failed(err, reached, confirmed));
                }
            }
        }

        let tail = Self {
            valid_end: stream.last_end().unwrap_or(replay_from),
            torn_tail: stream.inner().inner().torn_tail(),
            incomplete_tail: stream.incomplete_tail(),
            versions,
            last_checkpoint,
            replay_from,
            covered_tx_id,
            transactions_after_checkpoint: count,
            first_tx_after_checkpoint: first,
            last_committed_tx_id: last.unwrap_or(0).max(checkpoint_last).max(header_last),
            corruption,
        };
        debug!(
            replay_from = %tail.replay_from,
            valid_end = %tail.valid_end,
            transactions = tail.transactions_after_checkpoint,
            last_committed = tail.last_committed_tx_id,
            "scanned log tail"
        );
        Ok(tail)
    }

    /// Returns true if there are no log files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Replay normally starts at the checkpoint entry. In a legacy file a
/// transaction may have started before the checkpoint and commit after it,
/// so the whole file is read and what the checkpoint covers is skipped.
fn replay_start(files: &LogFiles, checkpoint: &CheckpointRecord) -> CoreResult<(LogPosition, u64)> {
    let version = checkpoint.position.log_version;
    match files.read_header(version)? {
        Some(header) if header.format_version == FormatVersion::Legacy => {
            debug!(version, "checkpoint is in a legacy file, reading it from its start");
            Ok((LogFiles::first_entry_position(version), checkpoint.last_tx_id))
        }
        _ => Ok((checkpoint.position, 0)),
    }
}

fn start_of_log(versions: &[u64]) -> LogPosition {
    LogFiles::first_entry_position(versions.first().copied().unwrap_or(0))
}

/// Finds the newest checkpoint entry, searching versions from the newest.
///
/// A damaged entry ends the search within its file; the forward scan
/// reports it.
///
/// # Errors
///
/// Returns an error if the store cannot be listed.
pub fn find_last_checkpoint(
    files: &LogFiles,
    versions: &[u64],
) -> CoreResult<Option<CheckpointRecord>> {
    for &version in versions.iter().rev() {
        let mut found = None;
        for entry in files.open_version_cursor(version)? {
            match entry {
                Ok(entry) => {
                    if let Some(record) = CheckpointRecord::from_entry(&entry) {
                        found = Some(record);
                    }
                }
                Err(err) => {
                    debug!(version, error = %err, "stopping checkpoint search in damaged file");
                    break;
                }
            }
        }
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

fn newest_header_last_committed(files: &LogFiles, versions: &[u64]) -> CoreResult<u64> {
    for &version in versions.iter().rev() {
        match files.read_header(version) {
            Ok(Some(header)) => return Ok(header.last_committed_tx_id),
            Ok(None) => continue,
            Err(err) if err.is_log_corruption() => {
                debug!(version, error = %err, "skipping damaged header");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLogStore;
    use std::sync::Arc;
    use trellis_codec::{encode_entry, encode_legacy_entry, LogEntry, LogHeader};

    fn log_with(entries: &[LogEntry]) -> (MemoryLogStore, LogFiles) {
        let store = MemoryLogStore::new();
        let mut bytes = LogHeader::current(0, 0).encode();
        for entry in entries {
            encode_entry(entry, &mut bytes).unwrap();
        }
        store.insert(0, bytes);
        let files = LogFiles::new(Arc::new(store.clone()), 1 << 20, 4096);
        (store, files)
    }

    fn group(tx_id: u64) -> Vec<LogEntry> {
        let timestamp = 1_000 + tx_id;
        let commands = vec![vec![tx_id as u8]];
        vec![
            LogEntry::Start {
                tx_id,
                last_committed_tx_id: tx_id - 1,
                timestamp,
                leader_term: 0,
                additional_data: Vec::new(),
            },
            LogEntry::Command {
                payload: commands[0].clone(),
            },
            LogEntry::Commit {
                tx_id,
                timestamp,
                checksum: crate::log::transaction_checksum(tx_id, timestamp, timestamp, &commands),
            },
        ]
    }

    #[test]
    fn empty_log() {
        let files = LogFiles::new(Arc::new(MemoryLogStore::new()), 1 << 20, 4096);
        let tail = LogTail::scan(&files, false).unwrap();
        assert!(tail.is_empty());
        assert_eq!(tail.last_committed_tx_id, 0);
        assert_eq!(tail.replay_from, LogPosition::new(0, 25));
    }

    #[test]
    fn scan_starts_at_last_checkpoint() {
        let mut entries = group(1);
        // Checkpoint after tx 1 recording the position right after it.
        let (_, probe) = log_with(&entries);
        let after_first = {
            let tail = LogTail::scan(&probe, false).unwrap();
            tail.valid_end
        };
        entries.push(LogEntry::Checkpoint {
            position: after_first,
            last_tx_id: 1,
            timestamp: 5,
            reason: "test".into(),
        });
        entries.extend(group(2));
        entries.extend(group(3));
        let (_, files) = log_with(&entries);

        let tail = LogTail::scan(&files, false).unwrap();
        assert_eq!(tail.replay_from, after_first);
        assert_eq!(tail.last_checkpoint.as_ref().unwrap().last_tx_id, 1);
        assert_eq!(tail.transactions_after_checkpoint, 2);
        assert_eq!(tail.first_tx_after_checkpoint, Some(2));
        assert_eq!(tail.last_committed_tx_id, 3);

        let all = LogTail::scan_all(&files, false).unwrap();
        assert_eq!(all.transactions_after_checkpoint, 3);
    }

    #[test]
    fn partial_group_is_not_counted() {
        let mut entries = group(1);
        let mut second = group(2);
        second.pop();
        entries.extend(second);
        let (_, files) = log_with(&entries);

        let tail = LogTail::scan(&files, false).unwrap();
        assert_eq!(tail.last_committed_tx_id, 1);
        assert_eq!(tail.incomplete_tail, Some(tail.valid_end));
    }

    #[test]
    fn legacy_checkpoint_inside_a_transaction_reads_the_whole_file() {
        let mut bytes = LogHeader {
            format_version: FormatVersion::Legacy,
            log_version: 0,
            last_committed_tx_id: 0,
        }
        .encode();
        for entry in group(1) {
            encode_legacy_entry(&entry, 1, &mut bytes).unwrap();
        }
        let second = group(2);
        encode_legacy_entry(&second[0], 2, &mut bytes).unwrap();
        let here = LogPosition::new(0, bytes.len() as u64);
        let checkpoint = LogEntry::Checkpoint {
            position: here,
            last_tx_id: 1,
            timestamp: 2_000,
            reason: "legacy".into(),
        };
        encode_legacy_entry(&checkpoint, 0, &mut bytes).unwrap();
        for entry in &second[1..] {
            encode_legacy_entry(entry, 2, &mut bytes).unwrap();
        }
        let store = MemoryLogStore::new();
        store.insert(0, bytes);
        let files = LogFiles::new(Arc::new(store), 1 << 20, 4096);

        let tail = LogTail::scan(&files, false).unwrap();
        assert_eq!(tail.last_checkpoint.as_ref().map(|c| c.position), Some(here));
        assert_eq!(tail.replay_from, LogPosition::new(0, 25));
        assert_eq!(tail.covered_tx_id, 1);
        assert_eq!(tail.transactions_after_checkpoint, 1);
        assert_eq!(tail.first_tx_after_checkpoint, Some(2));
        assert_eq!(tail.last_committed_tx_id, 2);
    }

    #[test]
    fn corruption_is_fatal_unless_tolerated() {
        let mut entries = group(1);
        entries.extend(group(2));
        let (store, _) = log_with(&entries);
        let mut bytes = store.file_bytes(0).unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0x40;
        store.insert(0, bytes);
        let files = LogFiles::new(Arc::new(store), 1 << 20, 4096);

        match LogTail::scan(&files, false).unwrap_err() {
            CoreError::RecoveryFailed {
                last_tx_id, source, ..
            } => {
                assert_eq!(last_tx_id, 1);
                assert!(source.is_log_corruption());
            }
            other => panic!("expected recovery failure, got {other:?}"),
        }

        let tail = LogTail::scan(&files, true).unwrap();
        assert!(tail.corruption.is_some());
        assert_eq!(tail.last_committed_tx_id, 1);
    }
}
