//! Transactions as written to and read back from the log.

use crate::error::{CoreError, CoreResult};
use crate::log::cursor::PositionedEntry;
use crate::types::{now_millis, TransactionId};
use sha2::{Digest, Sha256};
use trellis_codec::{FormatVersion, LogEntry, LogPosition};

/// Checksum stored in a commit entry.
///
/// First eight bytes (little endian) of the SHA-256 digest over the
/// transaction id, the start and commit timestamps and every command
/// prefixed by its length.
#[must_use]
pub fn transaction_checksum<C: AsRef<[u8]>>(
    tx_id: u64,
    start_timestamp: u64,
    commit_timestamp: u64,
    commands: &[C],
) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(tx_id.to_le_bytes());
    hasher.update(start_timestamp.to_le_bytes());
    hasher.update(commit_timestamp.to_le_bytes());
    for command in commands {
        let command = command.as_ref();
        hasher.update((command.len() as u64).to_le_bytes());
        hasher.update(command);
    }
    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

/// A transaction ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRepresentation {
    /// Transaction id. Assigned by the appender for `append_next`.
    pub tx_id: u64,
    /// Start time in milliseconds.
    pub timestamp: u64,
    /// Leader term of the writer.
    pub leader_term: u64,
    /// Opaque caller-supplied bytes stored in the start entry.
    pub additional_data: Vec<u8>,
    /// Storage-engine commands, in order.
    pub commands: Vec<Vec<u8>>,
}

impl TransactionRepresentation {
    /// Creates a transaction from its commands, stamped with the current time.
    #[must_use]
    pub fn new(commands: Vec<Vec<u8>>) -> Self {
        Self {
            tx_id: 0,
            timestamp: now_millis(),
            leader_term: 0,
            additional_data: Vec::new(),
            commands,
        }
    }

    /// Sets the transaction id.
    #[must_use]
    pub fn with_tx_id(mut self, tx_id: u64) -> Self {
        self.tx_id = tx_id;
        self
    }

    /// Sets the start timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the leader term.
    #[must_use]
    pub fn with_leader_term(mut self, leader_term: u64) -> Self {
        self.leader_term = leader_term;
        self
    }

    /// Sets the additional data.
    #[must_use]
    pub fn with_additional_data(mut self, data: Vec<u8>) -> Self {
        self.additional_data = data;
        self
    }

    /// Checksum stored in the commit entry written at `commit_timestamp`.
    #[must_use]
    pub fn checksum(&self, commit_timestamp: u64) -> u64 {
        transaction_checksum(self.tx_id, self.timestamp, commit_timestamp, &self.commands)
    }
}

/// A complete `Start..Commit` group read from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
    /// Transaction id.
    pub tx_id: u64,
    /// Last transaction committed when this one was appended.
    pub last_committed_tx_id: u64,
    /// Start time in milliseconds.
    pub start_timestamp: u64,
    /// Commit time in milliseconds.
    pub commit_timestamp: u64,
    /// Leader term recorded in the start entry.
    pub leader_term: u64,
    /// Additional data recorded in the start entry.
    pub additional_data: Vec<u8>,
    /// Checksum recorded in the commit entry (0 for legacy).
    pub checksum: u64,
    /// Command payloads, in order.
    pub commands: Vec<Vec<u8>>,
    /// Format of the file the transaction was read from.
    pub format: FormatVersion,
    /// Position of the start entry.
    pub start_position: LogPosition,
    /// Position of the commit entry.
    pub commit_position: LogPosition,
    /// Position after the commit entry.
    pub end_position: LogPosition,
}

impl CommittedTransaction {
    /// Identity of this transaction.
    #[must_use]
    pub fn transaction_id(&self) -> TransactionId {
        TransactionId::new(self.tx_id, self.checksum, self.commit_timestamp)
    }
}

struct PartialTransaction {
    tx_id: u64,
    last_committed_tx_id: u64,
    timestamp: u64,
    leader_term: u64,
    additional_data: Vec<u8>,
    commands: Vec<Vec<u8>>,
    format: FormatVersion,
    start_position: LogPosition,
}

/// Groups a stream of contiguous entries into committed transactions.
///
/// The input must already be in transaction order; legacy streams go
/// through the reordering cursor first. Checkpoint entries between
/// transactions are skipped. A transaction whose commit never arrives is
/// not yielded; [`TransactionCursor::incomplete_tail`] reports it.
pub struct TransactionCursor<I> {
    inner: I,
    pending: Option<PartialTransaction>,
    last_tx_id: Option<u64>,
    last_end: Option<LogPosition>,
    incomplete_tail: Option<LogPosition>,
    failed: bool,
}

impl<I> TransactionCursor<I>
where
    I: Iterator<Item = CoreResult<PositionedEntry>>,
{
    /// Wraps `inner`.
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            pending: None,
            last_tx_id: None,
            last_end: None,
            incomplete_tail: None,
            failed: false,
        }
    }

    /// End of the last complete transaction or checkpoint seen.
    ///
    /// Everything before this position is whole; cutting the log here
    /// leaves no partial group behind.
    #[must_use]
    pub fn last_end(&self) -> Option<LogPosition> {
        self.last_end
    }

    /// Start of a transaction left without a commit at the end of the stream.
    #[must_use]
    pub fn incomplete_tail(&self) -> Option<LogPosition> {
        self.incomplete_tail
    }

    /// Returns the wrapped stream.
    pub fn inner(&self) -> &I {
        &self.inner
    }

    fn accept(&mut self, entry: PositionedEntry) -> CoreResult<Option<CommittedTransaction>> {
        let PositionedEntry {
            entry: log_entry,
            format,
            position,
            end,
            ..
        } = entry;

        match log_entry {
            LogEntry::Start {
                tx_id,
                last_committed_tx_id,
                timestamp,
                leader_term,
                additional_data,
            } => {
                if let Some(open) = &self.pending {
                    return Err(CoreError::corrupt_log(
                        position,
                        format!(
                            "start of transaction {tx_id} while transaction {} is open",
                            open.tx_id
                        ),
                    ));
                }
                self.pending = Some(PartialTransaction {
                    tx_id,
                    last_committed_tx_id,
                    timestamp,
                    leader_term,
                    additional_data,
                    commands: Vec::new(),
                    format,
                    start_position: position,
                });
                Ok(None)
            }
            LogEntry::Command { payload } => match self.pending.as_mut() {
                Some(open) => {
                    open.commands.push(payload);
                    Ok(None)
                }
                None => Err(CoreError::corrupt_log(
                    position,
                    "command outside of a transaction",
                )),
            },
            LogEntry::Commit {
                tx_id,
                timestamp,
                checksum,
            } => {
                let Some(open) = self.pending.take() else {
                    return Err(CoreError::corrupt_log(
                        position,
                        format!("commit of transaction {tx_id} without a start entry"),
                    ));
                };
                if open.tx_id != tx_id {
                    return Err(CoreError::corrupt_log(
                        position,
                        format!("commit of transaction {tx_id} closes transaction {}", open.tx_id),
                    ));
                }
                if let Some(last) = self.last_tx_id {
                    if tx_id <= last {
                        return Err(CoreError::corrupt_log(
                            position,
                            format!("transaction {tx_id} follows transaction {last}"),
                        ));
                    }
                }
                if open.format == FormatVersion::Current {
                    let actual =
                        transaction_checksum(tx_id, open.timestamp, timestamp, &open.commands);
                    if actual != checksum {
                        return Err(CoreError::TransactionChecksumMismatch {
                            tx_id,
                            position,
                            expected: checksum,
                            actual,
                        });
                    }
                }

                self.last_tx_id = Some(tx_id);
                self.last_end = Some(end);
                Ok(Some(CommittedTransaction {
                    tx_id,
                    last_committed_tx_id: open.last_committed_tx_id,
                    start_timestamp: open.timestamp,
                    commit_timestamp: timestamp,
                    leader_term: open.leader_term,
                    additional_data: open.additional_data,
                    checksum,
                    commands: open.commands,
                    format: open.format,
                    start_position: open.start_position,
                    commit_position: position,
                    end_position: end,
                }))
            }
            LogEntry::Checkpoint { .. } => {
                if let Some(open) = &self.pending {
                    if open.format == FormatVersion::Current {
                        return Err(CoreError::corrupt_log(
                            position,
                            format!("checkpoint inside transaction {}", open.tx_id),
                        ));
                    }
                } else {
                    self.last_end = Some(end);
                }
                Ok(None)
            }
        }
    }
}

impl<I> Iterator for TransactionCursor<I>
where
    I: Iterator<Item = CoreResult<PositionedEntry>>,
{
    type Item = CoreResult<CommittedTransaction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.inner.next() {
                None => {
                    if let Some(open) = self.pending.take() {
                        self.incomplete_tail = Some(open.start_position);
                    }
                    return None;
                }
                Some(Err(err)) => {
                    self.failed = true;
                    return Some(Err(err));
                }
                Some(Ok(entry)) => match self.accept(entry) {
                    Ok(Some(tx)) => return Some(Ok(tx)),
                    Ok(None) => {}
                    Err(err) => {
                        self.failed = true;
                        return Some(Err(err));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current(entry: LogEntry, offset: u64) -> CoreResult<PositionedEntry> {
        Ok(PositionedEntry {
            entry,
            identifier: None,
            format: FormatVersion::Current,
            position: LogPosition::new(0, offset),
            end: LogPosition::new(0, offset + 10),
        })
    }

    fn group(tx: &TransactionRepresentation, offset: u64) -> Vec<CoreResult<PositionedEntry>> {
        let mut entries = vec![current(
            LogEntry::Start {
                tx_id: tx.tx_id,
                last_committed_tx_id: tx.tx_id - 1,
                timestamp: tx.timestamp,
                leader_term: 0,
                additional_data: Vec::new(),
            },
            offset,
        )];
        let mut at = offset + 10;
        for command in &tx.commands {
            entries.push(current(
                LogEntry::Command {
                    payload: command.clone(),
                },
                at,
            ));
            at += 10;
        }
        entries.push(current(
            LogEntry::Commit {
                tx_id: tx.tx_id,
                timestamp: tx.timestamp + 1,
                checksum: tx.checksum(tx.timestamp + 1),
            },
            at,
        ));
        entries
    }

    #[test]
    fn checksum_depends_on_contents() {
        let a = transaction_checksum(1, 5, 7, &[b"x".to_vec()]);
        assert_eq!(a, transaction_checksum(1, 5, 7, &[b"x".to_vec()]));
        assert_ne!(a, transaction_checksum(2, 5, 7, &[b"x".to_vec()]));
        assert_ne!(a, transaction_checksum(1, 6, 7, &[b"x".to_vec()]));
        assert_ne!(a, transaction_checksum(1, 5, 8, &[b"x".to_vec()]));
        // Length prefixes keep command boundaries significant.
        assert_ne!(
            transaction_checksum(1, 5, 7, &[b"ab".to_vec(), b"c".to_vec()]),
            transaction_checksum(1, 5, 7, &[b"a".to_vec(), b"bc".to_vec()])
        );
    }

    #[test]
    fn groups_complete_transactions() {
        let first = TransactionRepresentation::new(vec![b"a".to_vec(), b"b".to_vec()]).with_tx_id(1);
        let second = TransactionRepresentation::new(vec![]).with_tx_id(2);
        let mut entries = group(&first, 0);
        entries.extend(group(&second, 100));

        let mut cursor = TransactionCursor::new(entries.into_iter());
        let txs: Vec<_> = cursor.by_ref().map(|t| t.unwrap()).collect();

        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].commands, first.commands);
        assert_eq!(txs[0].commit_position, LogPosition::new(0, 30));
        assert_eq!(txs[1].tx_id, 2);
        assert_eq!(cursor.last_end(), Some(LogPosition::new(0, 120)));
        assert_eq!(cursor.incomplete_tail(), None);
    }

    #[test]
    fn trailing_partial_group_is_reported_not_yielded() {
        let first = TransactionRepresentation::new(vec![b"a".to_vec()]).with_tx_id(1);
        let second = TransactionRepresentation::new(vec![b"b".to_vec()]).with_tx_id(2);
        let mut entries = group(&first, 0);
        let mut partial = group(&second, 100);
        partial.pop();
        entries.extend(partial);

        let mut cursor = TransactionCursor::new(entries.into_iter());
        assert_eq!(cursor.by_ref().count(), 1);
        assert_eq!(cursor.last_end(), Some(LogPosition::new(0, 30)));
        assert_eq!(cursor.incomplete_tail(), Some(LogPosition::new(0, 100)));
    }

    #[test]
    fn mismatched_checksum_is_detected() {
        let tx = TransactionRepresentation::new(vec![b"a".to_vec()]).with_tx_id(1);
        let mut entries = group(&tx, 0);
        entries[1] = current(
            LogEntry::Command {
                payload: b"z".to_vec(),
            },
            10,
        );

        let mut cursor = TransactionCursor::new(entries.into_iter());
        match cursor.next() {
            Some(Err(CoreError::TransactionChecksumMismatch { tx_id, position, .. })) => {
                assert_eq!(tx_id, 1);
                assert_eq!(position, LogPosition::new(0, 20));
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
        assert!(cursor.next().is_none());
    }

    #[test]
    fn rewritten_commit_timestamp_fails_verification() {
        let tx = TransactionRepresentation::new(vec![b"a".to_vec()]).with_tx_id(1);
        let mut entries = group(&tx, 0);
        entries[2] = current(
            LogEntry::Commit {
                tx_id: 1,
                timestamp: tx.timestamp + 2,
                checksum: tx.checksum(tx.timestamp + 1),
            },
            20,
        );

        let mut cursor = TransactionCursor::new(entries.into_iter());
        assert!(matches!(
            cursor.next(),
            Some(Err(CoreError::TransactionChecksumMismatch { tx_id: 1, .. }))
        ));
    }

    #[test]
    fn decreasing_ids_are_corruption() {
        let a = TransactionRepresentation::new(vec![]).with_tx_id(5);
        let b = TransactionRepresentation::new(vec![]).with_tx_id(4);
        let mut entries = group(&a, 0);
        entries.extend(group(&b, 100));

        let mut cursor = TransactionCursor::new(entries.into_iter());
        assert!(cursor.next().unwrap().is_ok());
        assert!(cursor.next().unwrap().unwrap_err().is_log_corruption());
    }

    #[test]
    fn nested_start_is_corruption() {
        let a = TransactionRepresentation::new(vec![]).with_tx_id(1);
        let mut entries = group(&a, 0);
        entries.remove(1);
        entries.extend(group(&a.clone().with_tx_id(2), 100));

        let mut cursor = TransactionCursor::new(entries.into_iter());
        assert!(cursor.next().unwrap().unwrap_err().is_log_corruption());
    }
}
