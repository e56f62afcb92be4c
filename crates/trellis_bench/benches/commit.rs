//! Commit path benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use trellis_bench::{node_commands, random_payload};
use trellis_core::{
    Config, Database, FileLogStore, GraphStore, LogFiles, StorageEngine, TransactionAppender,
    TransactionRepresentation,
};
use trellis_testkit::open_file_database;

/// Benchmark single-node commits against an in-memory log.
fn bench_memory_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_commit");

    for nodes in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*nodes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(nodes), nodes, |b, &nodes| {
            let engine = Arc::new(GraphStore::in_memory());
            let db = Database::open_in_memory(Arc::clone(&engine) as Arc<dyn StorageEngine>)
                .unwrap();

            b.iter(|| {
                let commands = node_commands(&engine, nodes).unwrap();
                black_box(db.commit(commands).unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark appending and forcing transactions with opaque payloads,
/// without applying them anywhere.
fn bench_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_append");

    for size in [64, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let temp = TempDir::new().unwrap();
            let store = FileLogStore::new(temp.path().join("logs")).unwrap();
            let files = Arc::new(LogFiles::new(Arc::new(store), 64 * 1024 * 1024, 64 * 1024));
            files.activate(0).unwrap();
            let appender = TransactionAppender::new(files, 0, Duration::ZERO);
            let payload = random_payload(size);

            b.iter(|| {
                let mut tx = TransactionRepresentation::new(vec![payload.clone()]);
                let commitment = appender.append_next(&mut tx).unwrap();
                commitment.wait_until_durable().unwrap();
                black_box(commitment.end_position());
            });
        });
    }
    group.finish();
}

/// Benchmark durable commits from several threads sharing flushes.
fn bench_group_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("group_commit");
    group.sample_size(10);

    for threads in [1, 4, 8].iter() {
        group.throughput(Throughput::Elements(*threads as u64 * 50));
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            threads,
            |b, &threads| {
                let temp = TempDir::new().unwrap();
                let config = Config::default().group_commit_window(Duration::from_micros(200));
                let (db, engine) =
                    open_file_database(&temp.path().join("bench.trellis"), config).unwrap();
                let db = Arc::new(db);

                b.iter(|| {
                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let db = Arc::clone(&db);
                            let engine = Arc::clone(&engine);
                            thread::spawn(move || {
                                for _ in 0..50 {
                                    let commands = node_commands(&engine, 1).unwrap();
                                    db.commit(commands).unwrap();
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

/// Benchmark forced checkpoints.
fn bench_checkpoint(c: &mut Criterion) {
    c.bench_function("checkpoint", |b| {
        let engine = Arc::new(GraphStore::in_memory());
        let db = Database::open_in_memory(Arc::clone(&engine) as Arc<dyn StorageEngine>).unwrap();
        for _ in 0..100 {
            db.commit(node_commands(&engine, 1).unwrap()).unwrap();
        }

        b.iter(|| {
            db.commit(node_commands(&engine, 1).unwrap()).unwrap();
            black_box(db.checkpoint("bench").unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_memory_commit,
    bench_log_append,
    bench_group_commit,
    bench_checkpoint,
);
criterion_main!(benches);
