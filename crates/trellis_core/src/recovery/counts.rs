//! Reconciling the counts store with replayed transactions.

use crate::engine::{CountsDelta, CountsState, StorageEngine};
use crate::error::CoreResult;
use tracing::{debug, info};

/// How the counts were brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountsOutcome {
    /// The counts already covered every replayed transaction.
    Unchanged,
    /// Replayed deltas were added to the stored counts.
    Merged {
        /// Number of keys that changed.
        keys: usize,
    },
    /// The counts were recomputed from the records.
    Rebuilt,
}

/// Accumulates the counts changes of replayed transactions.
///
/// Only transactions newer than the counts store's own transaction id
/// contribute; older ones are already part of the stored counts.
#[derive(Debug)]
pub struct CountsRecovery {
    counts_tx_id: u64,
    rebuild: bool,
    delta: CountsDelta,
    last_tx_id: u64,
}

impl CountsRecovery {
    /// Starts accumulating against the counts store `state`.
    ///
    /// With `force_rebuild`, or if the store is inconsistent, deltas are
    /// ignored and the counts are rebuilt at the end.
    #[must_use]
    pub fn new(state: CountsState, force_rebuild: bool) -> Self {
        Self {
            counts_tx_id: state.tx_id,
            rebuild: force_rebuild || !state.consistent,
            delta: CountsDelta::new(),
            last_tx_id: state.tx_id,
        }
    }

    /// Records the counts changes of replayed transaction `tx_id`.
    pub fn record(&mut self, tx_id: u64, delta: &CountsDelta) {
        if !self.rebuild && tx_id > self.counts_tx_id {
            self.delta.merge(delta);
        }
        self.last_tx_id = self.last_tx_id.max(tx_id);
    }

    /// Returns true if the counts will be rebuilt rather than merged.
    #[must_use]
    pub fn will_rebuild(&self) -> bool {
        self.rebuild
    }

    /// Applies the result to `engine`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error if merging or rebuilding fails.
    pub fn finish(self, engine: &dyn StorageEngine) -> CoreResult<CountsOutcome> {
        if self.rebuild {
            engine.rebuild_counts()?;
            return Ok(CountsOutcome::Rebuilt);
        }
        if self.last_tx_id <= self.counts_tx_id {
            debug!(tx_id = self.counts_tx_id, "counts store already current");
            return Ok(CountsOutcome::Unchanged);
        }
        let keys = self.delta.len();
        engine.merge_counts(&self.delta, self.last_tx_id)?;
        info!(
            keys,
            from = self.counts_tx_id,
            to = self.last_tx_id,
            "merged recovered counts"
        );
        Ok(CountsOutcome::Merged { keys })
    }
}
