//! # Trellis Core
//!
//! Durability for the Trellis graph store.
//!
//! This crate provides:
//! - The transaction log: versioned files, group-committed appends and
//!   cursors that read committed transactions back
//! - Checkpointing of the storage engine against the log
//! - Crash recovery, including point-in-time recovery and reconciliation of
//!   the counts store
//! - Migration of legacy-format log files
//! - A reference [`GraphStore`] engine behind the [`StorageEngine`] boundary
//!
//! A transaction is reported committed only after its log entries are
//! durable. Whatever was committed before a crash is applied again to the
//! engine on the next [`Database`] open.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod database;
mod dir;
mod engine;
mod error;
pub mod log;
mod migration;
pub mod recovery;
mod types;

pub use checkpoint::{CheckpointRecord, CheckpointThreshold, Checkpointer};
pub use config::Config;
pub use database::Database;
pub use dir::{DatabaseDir, DatabaseLayout};
pub use engine::{
    ApplyError, ApplyMode, CommandBatch, CountsDelta, CountsKey, CountsSnapshot, CountsState,
    FileSnapshot, GraphCommand, GraphStore, GraphTransaction, MemorySnapshot, NodeRecord,
    PropertyValue, RelationshipRecord, SnapshotSlot, StorageEngine, NO_TOKEN,
};
pub use error::{CoreError, CoreResult};
pub use log::{
    read_transactions, CommittedTransaction, FileLogStore, LogFiles, LogStore, MemoryLogStore,
    TransactionAppender, TransactionRepresentation,
};
pub use migration::{LegacyLogMigrator, MigrationReport};
pub use recovery::{
    CancellationToken, LoggingMonitor, RecoveryCriteria, RecoveryMonitor, RecoveryOrchestrator,
    RecoveryOutcome, RecoveryPhase, RecoveryReport,
};
pub use types::{TransactionId, BASE_TX_ID};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export the log codec types that appear in this crate's API.
pub use trellis_codec::{FormatVersion, LogEntry, LogHeader, LogPosition};
