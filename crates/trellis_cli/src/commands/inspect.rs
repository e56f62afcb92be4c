//! Inspect command implementation.

use super::{open_log, CliResult};
use serde::Serialize;
use std::path::Path;
use trellis_core::recovery::find_last_checkpoint;
use trellis_core::{GraphStore, LogStore, StorageEngine};
use trellis_storage::StorageBackend;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Log files, oldest first.
    pub log_files: Vec<LogFileInfo>,
    /// Total size of the log files in bytes.
    pub log_size: u64,
    /// Newest checkpoint in the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<CheckpointInfo>,
    /// State of the store files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreInfo>,
}

/// One physical log file.
#[derive(Debug, Serialize)]
pub struct LogFileInfo {
    /// Log version.
    pub version: u64,
    /// Entry format, or `None` if the header is missing or damaged.
    pub format: Option<String>,
    /// Last transaction committed before the file was started.
    pub last_committed_tx_id: Option<u64>,
    /// File size in bytes.
    pub size: u64,
}

/// The newest checkpoint.
#[derive(Debug, Serialize)]
pub struct CheckpointInfo {
    /// Last transaction the checkpoint made durable.
    pub last_tx_id: u64,
    /// Where recovery would replay from.
    pub replay_from: String,
    /// Where the checkpoint entry is.
    pub entry_position: String,
    /// Checkpoint time in milliseconds.
    pub timestamp: u64,
    /// Why it was written.
    pub reason: String,
}

/// Store files.
#[derive(Debug, Serialize)]
pub struct StoreInfo {
    /// Last transaction applied to the records.
    pub last_applied_tx_id: u64,
    /// Last transaction reflected in the counts.
    pub counts_tx_id: u64,
    /// Whether the counts can be trusted.
    pub counts_consistent: bool,
    /// Number of nodes.
    pub nodes: usize,
    /// Number of relationships.
    pub relationships: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let (layout, files) = open_log(path)?;
    let versions = files.versions()?;

    let mut log_files = Vec::with_capacity(versions.len());
    for &version in &versions {
        let size = files.store().open(version)?.size()?;
        let header = files.read_header(version).ok().flatten();
        log_files.push(LogFileInfo {
            version,
            format: header.map(|h| format!("{:?}", h.format_version)),
            last_committed_tx_id: header.map(|h| h.last_committed_tx_id),
            size,
        });
    }

    let last_checkpoint = find_last_checkpoint(&files, &versions)?.map(|c| CheckpointInfo {
        last_tx_id: c.last_tx_id,
        replay_from: c.position.to_string(),
        entry_position: c.entry_position.to_string(),
        timestamp: c.timestamp,
        reason: c.reason,
    });

    let store = match GraphStore::open(&layout) {
        Ok(engine) => {
            let counts = engine.counts_state();
            Some(StoreInfo {
                last_applied_tx_id: engine.last_applied_transaction_id(),
                counts_tx_id: counts.tx_id,
                counts_consistent: counts.consistent,
                nodes: engine.node_count(),
                relationships: engine.relationship_count(),
            })
        }
        Err(err) => {
            eprintln!("Cannot read store files: {err}");
            None
        }
    };

    let result = InspectResult {
        path: path.display().to_string(),
        log_size: log_files.iter().map(|f| f.size).sum(),
        log_files,
        last_checkpoint,
        store,
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text_output(&result),
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Trellis Database Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Log files ({}, {}):", result.log_files.len(), format_size(result.log_size));
    for file in &result.log_files {
        println!(
            "  [{}] {:8} last committed before: {:>8}  {}",
            file.version,
            file.format.as_deref().unwrap_or("damaged"),
            file.last_committed_tx_id
                .map_or_else(|| "-".to_string(), |id| id.to_string()),
            format_size(file.size)
        );
    }
    println!();
    match &result.last_checkpoint {
        Some(checkpoint) => {
            println!("Last checkpoint:");
            println!("  Transaction:  {}", checkpoint.last_tx_id);
            println!("  Replay from:  {}", checkpoint.replay_from);
            println!("  Entry at:     {}", checkpoint.entry_position);
            println!("  Reason:       {}", checkpoint.reason);
        }
        None => println!("Last checkpoint: none"),
    }
    if let Some(store) = &result.store {
        println!();
        println!("Store:");
        println!("  Last applied:  {}", store.last_applied_tx_id);
        println!(
            "  Counts:        up to {} ({})",
            store.counts_tx_id,
            if store.counts_consistent {
                "consistent"
            } else {
                "needs rebuild"
            }
        );
        println!("  Nodes:         {}", store.nodes);
        println!("  Relationships: {}", store.relationships);
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
