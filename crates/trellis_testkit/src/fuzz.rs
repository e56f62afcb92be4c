//! Fuzz testing harnesses for Trellis.
//!
//! This module provides fuzz targets that can be used with cargo-fuzz
//! or other fuzzing frameworks. None of them may panic on any input.

use std::sync::Arc;
use trellis_codec::{decode_entry, FormatVersion, LogHeader};
use trellis_core::{
    Config, Database, GraphCommand, GraphStore, LoggingMonitor, MemoryLogStore, StorageEngine,
};

/// Fuzz target for frame decoding.
///
/// Tests that arbitrary byte sequences either decode to an entry framed
/// within the input, or return a proper error.
pub fn fuzz_entry_decode(data: &[u8]) {
    for format in [FormatVersion::Current, FormatVersion::Legacy] {
        if let Ok(decoded) = decode_entry(data, format) {
            assert!(decoded.encoded_len <= data.len(), "decoded past the input");
        }
    }
}

/// Fuzz target for log header decoding.
pub fn fuzz_header_decode(data: &[u8]) {
    if let Ok(header) = LogHeader::decode(data) {
        let encoded = header.encode();
        assert_eq!(
            LogHeader::decode(&encoded).ok(),
            Some(header),
            "Roundtrip mismatch"
        );
    }
}

/// Fuzz target for storage engine commands.
pub fn fuzz_command_decode(data: &[u8]) {
    let _ = GraphCommand::decode(data);
}

/// Fuzz target for recovery.
///
/// Installs `data` after a valid header as the only log file and opens a
/// database on it with corruption tolerated. Opening may fail; it must not
/// panic, and a successful open must accept a new commit.
pub fn fuzz_log_recovery(data: &[u8]) {
    let store = MemoryLogStore::new();
    let mut bytes = LogHeader::current(0, 0).encode();
    bytes.extend_from_slice(data);
    store.insert(0, bytes);

    let engine = Arc::new(GraphStore::in_memory());
    let db = match Database::open_with_store(
        Arc::new(store),
        Config::default().fail_on_corrupted_log(false),
        Arc::clone(&engine) as Arc<dyn StorageEngine>,
        &LoggingMonitor,
    ) {
        Ok(db) => db,
        Err(_) => return,
    };

    let mut tx = engine.begin();
    tx.create_node([0]);
    if let Ok(commands) = tx.into_commands() {
        let committed = db.commit(commands);
        assert!(committed.is_ok(), "commit after recovery failed");
    }
}
