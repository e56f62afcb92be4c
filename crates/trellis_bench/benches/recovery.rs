//! Recovery and migration benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use trellis_bench::{crashed_files, legacy_log};
use trellis_core::recovery::LogTail;
use trellis_core::{Config, LegacyLogMigrator, LogFiles, MemoryLogStore};

/// Benchmark opening a database that has to replay its whole log.
fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    group.sample_size(20);

    for transactions in [100, 1000, 5000].iter() {
        group.throughput(Throughput::Elements(*transactions as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(transactions),
            transactions,
            |b, &transactions| {
                let files = crashed_files(transactions).unwrap();

                b.iter_batched(
                    || files.crash_image(),
                    |image| {
                        let db = image
                            .open(Config::default().checkpoint_on_close(false))
                            .unwrap();
                        black_box(db.recovery_report().replayed_transactions);
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

/// Benchmark the scan that locates the last checkpoint and the log tail.
fn bench_tail_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("tail_scan");

    for transactions in [100, 1000, 5000].iter() {
        group.throughput(Throughput::Elements(*transactions as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(transactions),
            transactions,
            |b, &transactions| {
                let image = crashed_files(transactions).unwrap();
                let files = LogFiles::new(Arc::new(image.log), 64 * 1024 * 1024, 64 * 1024);

                b.iter(|| black_box(LogTail::scan(&files, false).unwrap()));
            },
        );
    }
    group.finish();
}

/// Benchmark rewriting interleaved legacy logs.
fn bench_migration(c: &mut Criterion) {
    let mut group = c.benchmark_group("migration");
    group.sample_size(20);

    for transactions in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*transactions));
        group.bench_with_input(
            BenchmarkId::from_parameter(transactions),
            transactions,
            |b, &transactions| {
                let legacy = legacy_log(transactions, 128).build();

                b.iter_batched(
                    || {
                        let store = MemoryLogStore::new();
                        store.insert(0, legacy.clone());
                        store
                    },
                    |store| {
                        let report = LegacyLogMigrator::new(Arc::new(store)).migrate().unwrap();
                        black_box(report.transactions);
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_replay, bench_tail_scan, bench_migration);
criterion_main!(benches);
