//! Regrouping of interleaved legacy entries into whole transactions.
//!
//! Legacy writers appended the entries of concurrent transactions into the
//! same file, tagged with a per-writer identifier. Downstream consumers
//! expect each transaction's `Start`, `Command`s and `Commit` to be
//! contiguous, so entries are buffered per identifier and released when
//! the `Commit` arrives. Transactions are therefore emitted in commit order,
//! and every entry keeps the physical position it was read at.

use crate::error::{CoreError, CoreResult};
use crate::log::cursor::PositionedEntry;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use trellis_codec::EntryType;

/// Wraps an entry stream and emits each legacy transaction contiguously.
///
/// Entries without an identifier (current format) and checkpoints pass
/// through unchanged. Transactions that never commit before the stream ends
/// are dropped; [`ReorderingCursor::discarded`] counts them.
pub struct ReorderingCursor<I> {
    inner: I,
    pending: HashMap<u32, Vec<PositionedEntry>>,
    ready: VecDeque<PositionedEntry>,
    discarded: usize,
    done: bool,
}

impl<I> ReorderingCursor<I>
where
    I: Iterator<Item = CoreResult<PositionedEntry>>,
{
    /// Wraps `inner`.
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            pending: HashMap::new(),
            ready: VecDeque::new(),
            discarded: 0,
            done: false,
        }
    }

    /// Number of transactions dropped for lack of a commit.
    ///
    /// Only final once the cursor is exhausted.
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Returns the wrapped stream.
    pub fn inner(&self) -> &I {
        &self.inner
    }

    fn buffer(&mut self, entry: PositionedEntry, identifier: u32) -> CoreResult<()> {
        match entry.entry.entry_type() {
            EntryType::Start => {
                let tx_id = entry.entry.tx_id();
                if let Some(previous) = self.pending.insert(identifier, vec![entry]) {
                    // The writer restarted without committing; its earlier
                    // entries belong to nothing.
                    debug!(
                        identifier,
                        ?tx_id,
                        dropped = previous.len(),
                        "discarding uncommitted legacy entries"
                    );
                    self.discarded += 1;
                }
            }
            EntryType::Command => match self.pending.get_mut(&identifier) {
                Some(buffer) => buffer.push(entry),
                None => {
                    return Err(CoreError::corrupt_log(
                        entry.position,
                        format!("command for identifier {identifier} without a start entry"),
                    ))
                }
            },
            EntryType::Commit => match self.pending.remove(&identifier) {
                Some(buffer) => {
                    self.ready.extend(buffer);
                    self.ready.push_back(entry);
                }
                None => {
                    return Err(CoreError::corrupt_log(
                        entry.position,
                        format!("commit for identifier {identifier} without a start entry"),
                    ))
                }
            },
            EntryType::Checkpoint => self.ready.push_back(entry),
        }
        Ok(())
    }
}

impl<I> Iterator for ReorderingCursor<I>
where
    I: Iterator<Item = CoreResult<PositionedEntry>>,
{
    type Item = CoreResult<PositionedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.ready.pop_front() {
                return Some(Ok(entry));
            }
            if self.done {
                return None;
            }
            match self.inner.next() {
                None => {
                    self.done = true;
                    if !self.pending.is_empty() {
                        debug!(
                            transactions = self.pending.len(),
                            "legacy log ends with uncommitted transactions"
                        );
                        self.discarded += self.pending.len();
                        self.pending.clear();
                    }
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                Some(Ok(entry)) => match entry.identifier {
                    None => return Some(Ok(entry)),
                    Some(identifier) => {
                        if let Err(err) = self.buffer(entry, identifier) {
                            self.done = true;
                            return Some(Err(err));
                        }
                    }
                },
            }
        }
    }
}
