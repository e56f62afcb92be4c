//! Verify command implementation.

use super::{open_log, CliResult};
use std::path::Path;
use trellis_core::recovery::LogTail;
use trellis_core::{GraphStore, StorageEngine};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of log files checked.
    pub files_checked: usize,
    /// Number of intact committed transactions.
    pub transactions: u64,
    /// Highest committed transaction id in the log.
    pub last_committed_tx_id: u64,
    /// Problems that make the database unrecoverable as is.
    pub errors: Vec<String>,
    /// Problems recovery deals with on its own.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> CliResult<()> {
    println!("Verifying database at {}", path.display());
    println!();

    let (layout, files) = open_log(path)?;
    let mut result = VerifyResult::default();

    println!("Checking log headers...");
    let versions = files.versions()?;
    result.files_checked = versions.len();
    for pair in versions.windows(2) {
        if pair[1] != pair[0] + 1 {
            result
                .errors
                .push(format!("log versions {} to {} are missing", pair[0] + 1, pair[1] - 1));
        }
    }
    for &version in &versions {
        match files.read_header(version) {
            Ok(Some(_)) => {}
            Ok(None) => result
                .warnings
                .push(format!("log version {version} has no complete header")),
            Err(err) => result
                .errors
                .push(format!("log version {version}: {err}")),
        }
    }

    println!("Checking log entries...");
    match LogTail::scan_all(&files, true) {
        Ok(tail) => {
            result.transactions = tail.transactions_after_checkpoint;
            result.last_committed_tx_id = tail.last_committed_tx_id;
            if let Some(err) = &tail.corruption {
                result.errors.push(format!("{err}"));
            }
            if let Some(torn) = tail.torn_tail {
                result
                    .warnings
                    .push(format!("partial entry at {torn} will be truncated"));
            }
            if let Some(start) = tail.incomplete_tail {
                result
                    .warnings
                    .push(format!("uncommitted transaction at {start} will be discarded"));
            }
        }
        Err(err) => result.errors.push(format!("cannot scan log: {err}")),
    }

    println!("Checking store files...");
    match GraphStore::open(&layout) {
        Ok(engine) => {
            let applied = engine.last_applied_transaction_id();
            if applied > result.last_committed_tx_id {
                result.errors.push(format!(
                    "store has applied transaction {applied} but the log ends at {}",
                    result.last_committed_tx_id
                ));
            }
            let counts = engine.counts_state();
            if !counts.consistent {
                result
                    .warnings
                    .push("counts store is damaged and will be rebuilt".to_string());
            }
        }
        Err(err) => result.errors.push(format!("primary store: {err}")),
    }

    print_result(&result);

    println!();
    if result.is_ok() {
        println!("✓ Database verification passed");
        Ok(())
    } else {
        println!("✗ Database verification failed");
        Err("Verification failed".into())
    }
}

fn print_result(result: &VerifyResult) {
    println!();
    println!("  Log files:            {}", result.files_checked);
    println!("  Intact transactions:  {}", result.transactions);
    println!("  Last committed:       {}", result.last_committed_tx_id);
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error: {error}");
    }
}
