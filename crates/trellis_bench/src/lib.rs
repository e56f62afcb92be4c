//! Benchmark utilities.

use rand::Rng;
use trellis_core::{Config, CoreResult, GraphStore};
use trellis_testkit::{LegacyLogBuilder, MemoryFiles};

/// Generate random command payload of the specified size.
pub fn random_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Commands of a transaction creating `nodes` nodes with random labels.
pub fn node_commands(engine: &GraphStore, nodes: usize) -> CoreResult<Vec<Vec<u8>>> {
    let mut rng = rand::thread_rng();
    let mut tx = engine.begin();
    for _ in 0..nodes {
        tx.create_node([rng.gen_range(0..8)]);
    }
    tx.into_commands()
}

/// Files left behind by a crash after `transactions` single-node commits
/// with no checkpoint, so that reopening replays all of them.
pub fn crashed_files(transactions: usize) -> CoreResult<MemoryFiles> {
    let files = MemoryFiles::new();
    let db = files.open(Config::default().checkpoint_on_close(false))?;
    for _ in 0..transactions {
        let commands = node_commands(&db.engine, 1)?;
        db.commit(commands)?;
    }
    Ok(db.crash_image())
}

/// A legacy log of `transactions` transactions written by two
/// interleaving writers.
pub fn legacy_log(transactions: u64, payload_size: usize) -> LegacyLogBuilder {
    let mut builder = LegacyLogBuilder::new(0, 0);
    let mut tx_id = 1;
    while tx_id < transactions {
        builder = builder
            .start(1, tx_id)
            .start(2, tx_id + 1)
            .command(1, random_payload(payload_size))
            .command(2, random_payload(payload_size))
            .commit(1, tx_id)
            .commit(2, tx_id + 1);
        tx_id += 2;
    }
    if tx_id == transactions {
        builder = builder.transaction(1, tx_id, &[random_payload(payload_size)]);
    }
    builder
}
