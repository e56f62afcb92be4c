//! Trellis CLI
//!
//! Command-line tools for Trellis transaction logs.
//!
//! # Commands
//!
//! - `inspect` - Show log files, the last checkpoint and store state
//! - `dump-log` - Dump log entries for debugging
//! - `verify` - Check the log and store files for damage
//! - `recover` - Run crash recovery, optionally to a point in time
//! - `migrate-logs` - Rewrite legacy log files in the current format
//! - `reapply` - Apply a range of logged transactions to the store

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Trellis command-line log and recovery tools.
#[derive(Parser)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show log files, the last checkpoint and store state
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump log entries for debugging
    DumpLog {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only dump this log version
        #[arg(long)]
        log_version: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check the log and store files for damage
    Verify,

    /// Run crash recovery
    Recover {
        /// Only report whether recovery is needed
        #[arg(long)]
        check: bool,

        /// Replay from the last checkpoint even after a clean shutdown
        #[arg(long)]
        force: bool,

        /// Stop before this transaction id
        #[arg(long, conflicts_with = "until_timestamp")]
        until_tx: Option<u64>,

        /// Stop before the first transaction committed at or after this
        /// time (milliseconds since the Unix epoch)
        #[arg(long)]
        until_timestamp: Option<u64>,

        /// Truncate the log at corruption instead of failing
        #[arg(long)]
        ignore_corruption: bool,

        /// Recompute the counts store from the records
        #[arg(long)]
        rebuild_counts: bool,
    },

    /// Rewrite legacy log files in the current format
    MigrateLogs {
        /// Drop a trailing transaction that has no commit
        #[arg(long)]
        allow_incomplete_tail: bool,

        /// List the files that would be rewritten
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Apply logged transactions `from..=to` to the store
    Reapply {
        /// First transaction id
        #[arg(long)]
        from: u64,

        /// Last transaction id (defaults to the end of the log)
        #[arg(long)]
        to: Option<u64>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpLog {
            limit,
            log_version,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for dump-log")?;
            commands::dump_log::run(&path, limit, log_version, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Database path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Recover {
            check,
            force,
            until_tx,
            until_timestamp,
            ignore_corruption,
            rebuild_counts,
        } => {
            let path = cli.path.ok_or("Database path required for recover")?;
            let options = commands::recover::RecoverOptions {
                check_only: check,
                force,
                until_tx,
                until_timestamp,
                ignore_corruption,
                rebuild_counts,
            };
            commands::recover::run(&path, &options)?;
        }
        Commands::MigrateLogs {
            allow_incomplete_tail,
            dry_run,
        } => {
            let path = cli.path.ok_or("Database path required for migrate-logs")?;
            commands::migrate::run(&path, allow_incomplete_tail, dry_run)?;
        }
        Commands::Reapply { from, to } => {
            let path = cli.path.ok_or("Database path required for reapply")?;
            commands::reapply::run(&path, from, to)?;
        }
        Commands::Version => {
            println!("Trellis CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Trellis Core v{}", trellis_core::VERSION);
        }
    }

    Ok(())
}
