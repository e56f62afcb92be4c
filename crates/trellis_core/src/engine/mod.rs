//! The storage engine boundary.
//!
//! The log and recovery code never look inside command payloads. They hand
//! committed batches to a [`StorageEngine`], which owns the records and the
//! derived counts, and ask it to make its state durable at checkpoints.
//!
//! [`GraphStore`] is the reference engine.

mod command;
mod counts;
mod graph;
mod snapshot;
mod transaction;

pub use command::{GraphCommand, NodeRecord, PropertyValue, RelationshipRecord};
pub use graph::GraphStore;
pub use snapshot::{FileSnapshot, MemorySnapshot, SnapshotSlot};
pub use transaction::GraphTransaction;

use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Token meaning "any label" or "any relationship type" in a counts key.
pub const NO_TOKEN: u32 = u32::MAX;

/// How a batch is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// A live commit. Records and counts are both updated.
    Normal,
    /// Replay of a logged transaction. Record changes must be idempotent;
    /// counts changes are returned instead of applied.
    Recovery,
}

/// The commands of one committed transaction.
#[derive(Debug, Clone, Copy)]
pub struct CommandBatch<'a> {
    /// Transaction id.
    pub tx_id: u64,
    /// Commit time in milliseconds.
    pub timestamp: u64,
    /// Opaque command payloads, in order.
    pub commands: &'a [Vec<u8>],
}

/// Errors raised by an engine while applying a batch.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A command payload could not be decoded.
    #[error("cannot decode command: {message}")]
    Decode {
        /// Decoder message.
        message: String,
    },

    /// A command is well formed but cannot be applied to the current state.
    #[error("invalid command: {message}")]
    InvalidCommand {
        /// Why the command was refused.
        message: String,
    },
}

/// Key of a single count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CountsKey {
    /// Nodes with `label`, or all nodes for [`NO_TOKEN`].
    Node {
        /// Label token.
        label: u32,
    },
    /// Relationships matching `(start label, type, end label)`, where any
    /// part may be [`NO_TOKEN`].
    Relationship {
        /// Start node label token.
        start: u32,
        /// Relationship type token.
        rel_type: u32,
        /// End node label token.
        end: u32,
    },
}

impl CountsKey {
    /// Key for nodes carrying `label`.
    #[must_use]
    pub const fn node(label: u32) -> Self {
        Self::Node { label }
    }

    /// Key for relationships matching the given tokens.
    #[must_use]
    pub const fn relationship(start: u32, rel_type: u32, end: u32) -> Self {
        Self::Relationship {
            start,
            rel_type,
            end,
        }
    }
}

/// Accumulated count changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountsDelta {
    changes: BTreeMap<CountsKey, i64>,
}

impl CountsDelta {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to `key`.
    pub fn add(&mut self, key: CountsKey, delta: i64) {
        if delta == 0 {
            return;
        }
        let value = self.changes.entry(key).or_insert(0);
        *value += delta;
        if *value == 0 {
            self.changes.remove(&key);
        }
    }

    /// Adds every change in `other`.
    pub fn merge(&mut self, other: &Self) {
        for (key, delta) in &other.changes {
            self.add(*key, *delta);
        }
    }

    /// Net change for `key`.
    #[must_use]
    pub fn get(&self, key: &CountsKey) -> i64 {
        self.changes.get(key).copied().unwrap_or(0)
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of keys with a non-zero change.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Iterates over the non-zero changes.
    pub fn iter(&self) -> impl Iterator<Item = (&CountsKey, &i64)> {
        self.changes.iter()
    }
}

/// What the counts store says about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountsState {
    /// Last transaction whose counts changes are included.
    pub tx_id: u64,
    /// False if the counts store was missing, damaged or not closed cleanly.
    pub consistent: bool,
}

/// A point-in-time copy of all counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountsSnapshot {
    /// Last transaction whose counts changes are included.
    pub tx_id: u64,
    /// Every non-zero count.
    pub counts: BTreeMap<CountsKey, i64>,
}

impl CountsSnapshot {
    /// Number of nodes with `label` (all nodes for [`NO_TOKEN`]).
    #[must_use]
    pub fn node_count(&self, label: u32) -> i64 {
        self.get(&CountsKey::node(label))
    }

    /// Number of relationships matching the given tokens.
    #[must_use]
    pub fn relationship_count(&self, start: u32, rel_type: u32, end: u32) -> i64 {
        self.get(&CountsKey::relationship(start, rel_type, end))
    }

    /// Count for `key`.
    #[must_use]
    pub fn get(&self, key: &CountsKey) -> i64 {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

/// Storage the log applies committed transactions to.
///
/// Implementations are shared between the committing threads and the
/// checkpointer, so every method takes `&self`.
pub trait StorageEngine: Send + Sync {
    /// Applies one committed batch.
    ///
    /// In [`ApplyMode::Normal`] the returned delta has already been applied
    /// to the counts. In [`ApplyMode::Recovery`] record changes are written
    /// as after-images, so replaying a batch twice has the effect of
    /// replaying it once, and the counts changes are only returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a command cannot be decoded or applied.
    fn apply(&self, batch: &CommandBatch<'_>, mode: ApplyMode) -> Result<CountsDelta, ApplyError>;

    /// Makes every applied change durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn flush_and_force(&self) -> CoreResult<()>;

    /// Last transaction applied to the primary records.
    fn last_applied_transaction_id(&self) -> u64;

    /// Durability state of the counts.
    fn counts_state(&self) -> CountsState;

    /// Copy of the current counts.
    fn counts_snapshot(&self) -> CountsSnapshot;

    /// Adds `delta` to the counts and records them as current up to
    /// `up_to_tx_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the counts cannot be updated.
    fn merge_counts(&self, delta: &CountsDelta, up_to_tx_id: u64) -> CoreResult<()>;

    /// Recomputes all counts from the primary records.
    ///
    /// # Errors
    ///
    /// Returns an error if the counts cannot be rebuilt.
    fn rebuild_counts(&self) -> CoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_drops_zero_entries() {
        let mut delta = CountsDelta::new();
        delta.add(CountsKey::node(1), 2);
        delta.add(CountsKey::node(1), -2);
        delta.add(CountsKey::node(2), 0);
        assert!(delta.is_empty());
    }

    #[test]
    fn delta_merge_adds() {
        let mut a = CountsDelta::new();
        a.add(CountsKey::node(NO_TOKEN), 1);
        let mut b = CountsDelta::new();
        b.add(CountsKey::node(NO_TOKEN), 2);
        b.add(CountsKey::relationship(NO_TOKEN, 4, NO_TOKEN), 1);

        a.merge(&b);
        assert_eq!(a.get(&CountsKey::node(NO_TOKEN)), 3);
        assert_eq!(a.len(), 2);
    }
}
