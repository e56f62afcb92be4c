//! Dump-log command implementation.

use super::{open_log, CliResult};
use serde::Serialize;
use std::path::Path;
use trellis_codec::LogEntry;
use trellis_core::log::PositionedEntry;

/// Log entry representation for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Position of the entry.
    pub position: String,
    /// Entry type.
    pub entry_type: String,
    /// Entry format.
    pub format: String,
    /// Writer identifier (legacy files only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<u32>,
    /// Transaction ID (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<u64>,
    /// Timestamp in milliseconds (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Transaction checksum (commit entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u64>,
    /// Payload size in bytes (command entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
    /// Replay position (checkpoint entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_from: Option<String>,
    /// Reason (checkpoint entries).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&PositionedEntry> for EntryInfo {
    fn from(positioned: &PositionedEntry) -> Self {
        let mut info = Self {
            position: positioned.position.to_string(),
            entry_type: positioned.entry.entry_type().to_string(),
            format: format!("{:?}", positioned.format),
            identifier: positioned.identifier,
            tx_id: None,
            timestamp: None,
            checksum: None,
            payload_size: None,
            replay_from: None,
            reason: None,
        };
        match &positioned.entry {
            LogEntry::Start {
                tx_id, timestamp, ..
            } => {
                info.tx_id = Some(*tx_id);
                info.timestamp = Some(*timestamp);
            }
            LogEntry::Command { payload } => info.payload_size = Some(payload.len()),
            LogEntry::Commit {
                tx_id,
                timestamp,
                checksum,
            } => {
                info.tx_id = Some(*tx_id);
                info.timestamp = Some(*timestamp);
                info.checksum = Some(*checksum);
            }
            LogEntry::Checkpoint {
                position,
                last_tx_id,
                timestamp,
                reason,
            } => {
                info.tx_id = Some(*last_tx_id);
                info.timestamp = Some(*timestamp);
                info.replay_from = Some(position.to_string());
                info.reason = Some(reason.clone());
            }
        }
        info
    }
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    log_version: Option<u64>,
    format: &str,
) -> CliResult<()> {
    let (_, files) = open_log(path)?;
    let mut cursor = match log_version {
        Some(version) => files.open_version_cursor(version)?,
        None => files.open_cursor_from_start()?,
    };
    let max_entries = limit.unwrap_or(usize::MAX);

    let mut entries = Vec::new();
    let mut failure = None;
    for item in cursor.by_ref() {
        if entries.len() >= max_entries {
            break;
        }
        match item {
            Ok(entry) => entries.push(EntryInfo::from(&entry)),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => print_text_output(&entries),
    }

    if let Some(torn) = cursor.torn_tail() {
        eprintln!("Log ends with a partial entry at {torn}");
    }
    match failure {
        Some(err) => Err(format!("Stopped at damaged entry: {err}").into()),
        None => Ok(()),
    }
}

fn print_text_output(entries: &[EntryInfo]) {
    println!("Log Entries ({} total)", entries.len());
    println!("=====================");
    println!();

    for entry in entries {
        print!("[{:>16}] {:10}", entry.position, entry.entry_type);

        if let Some(identifier) = entry.identifier {
            print!(" writer={identifier}");
        }
        if let Some(tx_id) = entry.tx_id {
            print!(" tx={tx_id}");
        }
        if let Some(timestamp) = entry.timestamp {
            print!(" ts={timestamp}");
        }
        if let Some(checksum) = entry.checksum {
            print!(" checksum={checksum:016x}");
        }
        if let Some(size) = entry.payload_size {
            print!(" payload={size} bytes");
        }
        if let Some(from) = &entry.replay_from {
            print!(" from={from}");
        }
        if let Some(reason) = &entry.reason {
            print!(" reason={reason:?}");
        }

        println!();
    }
}
