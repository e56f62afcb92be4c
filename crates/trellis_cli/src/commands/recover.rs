//! Recover command implementation.

use super::CliResult;
use std::path::Path;
use std::sync::Arc;
use trellis_core::{
    Config, Database, DatabaseDir, FileLogStore, GraphStore, LogFiles, LoggingMonitor,
    RecoveryCriteria, RecoveryOrchestrator, RecoveryReport, StorageEngine,
};

/// Options of the recover command.
#[derive(Debug, Default)]
pub struct RecoverOptions {
    /// Only report whether recovery is needed.
    pub check_only: bool,
    /// Replay even after a clean shutdown.
    pub force: bool,
    /// Stop before this transaction.
    pub until_tx: Option<u64>,
    /// Stop before this commit time.
    pub until_timestamp: Option<u64>,
    /// Truncate at corruption instead of failing.
    pub ignore_corruption: bool,
    /// Recompute the counts store.
    pub rebuild_counts: bool,
}

impl RecoverOptions {
    fn config(&self) -> Config {
        let criteria = match (self.until_tx, self.until_timestamp) {
            (Some(tx_id), _) => RecoveryCriteria::UntilTransaction(tx_id),
            (None, Some(timestamp)) => RecoveryCriteria::UntilTimestamp(timestamp),
            (None, None) => RecoveryCriteria::All,
        };
        Config::default()
            .create_if_missing(false)
            .force_recovery(self.force)
            .fail_on_corrupted_log(!self.ignore_corruption)
            .rebuild_counts(self.rebuild_counts)
            .recovery_criteria(criteria)
    }
}

/// Runs the recover command.
pub fn run(path: &Path, options: &RecoverOptions) -> CliResult<()> {
    let config = options.config();
    if options.check_only {
        return check(path, &config);
    }

    if !config.recovery_criteria.is_all() {
        println!(
            "Recovering {} ({}); later transactions are removed from the log",
            path.display(),
            config.recovery_criteria
        );
    }
    let db = Database::open_with(path, config, &LoggingMonitor, |layout| {
        Ok(Arc::new(GraphStore::open(layout)?) as Arc<dyn StorageEngine>)
    })?;
    print_report(db.recovery_report(), db.last_committed_transaction_id());
    db.close()?;
    Ok(())
}

fn check(path: &Path, config: &Config) -> CliResult<()> {
    let dir = DatabaseDir::open(path, false)?;
    let engine = GraphStore::open(dir.layout())?;
    let store = FileLogStore::new(dir.layout().logs_dir())?;
    let files = LogFiles::new(Arc::new(store), config.max_log_size, config.read_buffer_size);

    let mut recovery = RecoveryOrchestrator::new(&files, &engine, config, &LoggingMonitor);
    let required = recovery.check()?;

    if let Some(tail) = recovery.tail() {
        println!("Replay from:           {}", tail.replay_from);
        println!("Transactions to scan:  {}", tail.transactions_after_checkpoint);
        println!("Last committed in log: {}", tail.last_committed_tx_id);
    }
    println!("Last applied to store: {}", engine.last_applied_transaction_id());
    if required {
        println!("Recovery is required");
    } else {
        println!("No recovery needed");
    }
    Ok(())
}

fn print_report(report: &RecoveryReport, last_committed: u64) {
    println!("Outcome:               {:?}", report.outcome);
    println!("Replayed transactions: {}", report.replayed_transactions);
    if let (Some(first), Some(last)) = (report.first_replayed_tx_id, report.last_replayed_tx_id) {
        println!("Replayed range:        {first}..={last}");
    }
    if let Some(position) = report.truncated_at {
        println!("Log truncated at:      {position}");
    }
    if let Some(corruption) = &report.corruption {
        println!("Corruption:            {corruption}");
    }
    if report.stopped_by_criteria {
        println!("Stopped by criteria");
    }
    if let Some(counts) = &report.counts {
        println!("Counts:                {counts:?}");
    }
    println!("Last committed:        {last_committed}");
    println!("Elapsed:               {:?}", report.elapsed);
}
