//! Migrate-logs command implementation.

use super::CliResult;
use std::path::Path;
use std::sync::Arc;
use trellis_core::{DatabaseDir, FileLogStore, LegacyLogMigrator};

/// Runs the migrate-logs command.
///
/// Holds the database lock while rewriting so no writer appends to a file
/// being replaced.
pub fn run(path: &Path, allow_incomplete_tail: bool, dry_run: bool) -> CliResult<()> {
    let dir = DatabaseDir::open(path, false)?;
    let store = FileLogStore::new(dir.layout().logs_dir())?;
    let migrator =
        LegacyLogMigrator::new(Arc::new(store.clone())).allow_incomplete_tail(allow_incomplete_tail);

    let legacy = migrator.legacy_versions()?;
    if legacy.is_empty() {
        println!("No legacy log files found");
        return Ok(());
    }

    if dry_run {
        println!("Would migrate {} log file(s):", legacy.len());
        for version in legacy {
            println!("  {}", store.path(version).display());
        }
        return Ok(());
    }

    let report = migrator.migrate()?;
    println!("Migrated {} log file(s)", report.migrated_versions.len());
    for version in &report.migrated_versions {
        println!("  {}", store.path(*version).display());
    }
    println!("  Transactions:            {}", report.transactions);
    println!("  Checkpoints:             {}", report.checkpoints);
    if report.discarded_transactions > 0 {
        println!(
            "  Discarded (uncommitted): {}",
            report.discarded_transactions
        );
    }
    println!("Originals are kept with the .legacy suffix");
    Ok(())
}
