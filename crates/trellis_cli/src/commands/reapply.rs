//! Reapply command implementation.
//!
//! Replays logged transactions onto the store files of a stopped database,
//! the same way recovery does: records are written as after-images and the
//! counts are reconciled once at the end.

use super::CliResult;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use trellis_core::recovery::{CountsOutcome, CountsRecovery};
use trellis_core::{
    read_transactions, ApplyMode, CommandBatch, DatabaseDir, FileLogStore, GraphStore, LogFiles,
    StorageEngine,
};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// What a reapply run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapplySummary {
    /// Number of transactions applied.
    pub applied: u64,
    /// First applied transaction id.
    pub first_tx_id: u64,
    /// Last applied transaction id.
    pub last_tx_id: u64,
    /// How the counts were updated.
    pub counts: CountsOutcome,
}

/// Runs the reapply command.
pub fn run(path: &Path, from: u64, to: Option<u64>) -> CliResult<()> {
    let dir = DatabaseDir::open(path, false)?;
    let engine = GraphStore::open(dir.layout())?;
    let store = FileLogStore::new(dir.layout().logs_dir())?;
    let files = LogFiles::new(Arc::new(store), u64::MAX, READ_BUFFER_SIZE);

    let summary = reapply(&files, &engine, from, to.unwrap_or(u64::MAX))?;
    println!(
        "Applied {} transaction(s): {}..={}",
        summary.applied, summary.first_tx_id, summary.last_tx_id
    );
    println!("Counts: {:?}", summary.counts);
    if let Some(to) = to {
        if summary.last_tx_id < to {
            println!("The log ends at transaction {}", summary.last_tx_id);
        }
    }
    Ok(())
}

/// Applies the logged transactions with ids in `from..=to` to `engine` and
/// makes the result durable.
///
/// The range may overlap what the engine already holds but must not leave a
/// gap after it, and must reach at least the engine's last applied
/// transaction so no record is left at an older image.
pub fn reapply(
    files: &LogFiles,
    engine: &dyn StorageEngine,
    from: u64,
    to: u64,
) -> CliResult<ReapplySummary> {
    let last_applied = engine.last_applied_transaction_id();
    if from == 0 || to < from {
        return Err(format!("invalid transaction range {from}..={to}").into());
    }
    if from > last_applied + 1 {
        return Err(format!(
            "store has applied up to transaction {last_applied}; reapplying from {from} would leave a gap"
        )
        .into());
    }
    if to < last_applied {
        return Err(format!(
            "store has applied up to transaction {last_applied}; stopping at {to} would roll records back"
        )
        .into());
    }

    let first_version = files.versions()?.first().copied().unwrap_or(0);
    let stream = read_transactions(files, LogFiles::first_entry_position(first_version))?;
    let mut counts = CountsRecovery::new(engine.counts_state(), false);
    let mut applied = 0;
    let mut first_tx_id = None;
    let mut last_tx_id = 0;

    for tx in stream {
        let tx = tx?;
        if tx.tx_id < from {
            continue;
        }
        if tx.tx_id > to {
            break;
        }
        let batch = CommandBatch {
            tx_id: tx.tx_id,
            timestamp: tx.start_timestamp,
            commands: &tx.commands,
        };
        let delta = engine
            .apply(&batch, ApplyMode::Recovery)
            .map_err(|err| format!("transaction {}: {err}", tx.tx_id))?;
        counts.record(tx.tx_id, &delta);
        debug!(tx_id = tx.tx_id, "reapplied transaction");

        applied += 1;
        first_tx_id.get_or_insert(tx.tx_id);
        last_tx_id = tx.tx_id;
    }

    let Some(first_tx_id) = first_tx_id else {
        return Err(format!("no transactions in {from}..={to} found in the log").into());
    };
    if last_tx_id < last_applied {
        return Err(format!(
            "log ends at transaction {last_tx_id} but the store has applied {last_applied}"
        )
        .into());
    }

    let counts = counts.finish(engine)?;
    engine.flush_and_force()?;
    Ok(ReapplySummary {
        applied,
        first_tx_id,
        last_tx_id,
        counts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{Config, Database, MemoryLogStore, NO_TOKEN};

    /// Commits `n` node creations and returns the log.
    fn log_with(n: usize) -> MemoryLogStore {
        let store = MemoryLogStore::new();
        let writer = Arc::new(GraphStore::in_memory());
        let db = Database::open_with_store(
            Arc::new(store.clone()),
            Config::default().checkpoint_on_close(false),
            Arc::clone(&writer) as Arc<dyn StorageEngine>,
            &trellis_core::LoggingMonitor,
        )
        .unwrap();
        for label in 0..n {
            let mut tx = writer.begin();
            tx.create_node([label as u32]);
            db.commit(tx.into_commands().unwrap()).unwrap();
        }
        db.close().unwrap();
        store
    }

    fn files(store: &MemoryLogStore) -> LogFiles {
        LogFiles::new(Arc::new(store.clone()), u64::MAX, 4096)
    }

    #[test]
    fn reapply_onto_empty_store() {
        let store = log_with(3);
        let engine = GraphStore::in_memory();

        let summary = reapply(&files(&store), &engine, 1, u64::MAX).unwrap();
        assert_eq!(summary.applied, 3);
        assert_eq!(summary.first_tx_id, 1);
        assert_eq!(summary.last_tx_id, 3);
        assert_eq!(engine.node_count(), 3);
        assert_eq!(engine.counts_snapshot().node_count(NO_TOKEN), 3);
        assert_eq!(engine.last_applied_transaction_id(), 3);
    }

    #[test]
    fn overlapping_range_does_not_double_count() {
        let store = log_with(4);
        let engine = GraphStore::in_memory();
        reapply(&files(&store), &engine, 1, 2).unwrap();

        let summary = reapply(&files(&store), &engine, 2, 4).unwrap();
        assert_eq!(summary.applied, 3);
        assert_eq!(engine.node_count(), 4);
        assert_eq!(engine.counts_snapshot().node_count(NO_TOKEN), 4);
    }

    #[test]
    fn gaps_and_rollbacks_are_refused() {
        let store = log_with(4);
        let engine = GraphStore::in_memory();
        reapply(&files(&store), &engine, 1, 2).unwrap();

        assert!(reapply(&files(&store), &engine, 4, 4).is_err());
        assert!(reapply(&files(&store), &engine, 1, 1).is_err());
        assert!(reapply(&files(&store), &engine, 3, 2).is_err());
        assert_eq!(engine.node_count(), 2);
    }

    #[test]
    fn range_past_the_log_is_refused() {
        let store = log_with(2);
        let engine = GraphStore::in_memory();
        reapply(&files(&store), &engine, 1, u64::MAX).unwrap();

        assert!(reapply(&files(&store), &engine, 3, 9).is_err());
        assert_eq!(engine.last_applied_transaction_id(), 2);
    }
}
