//! Log entry codec benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use trellis_bench::random_payload;
use trellis_codec::{
    decode_entry, encode_entry, encode_legacy_entry, FormatVersion, LogEntry, LogHeader,
    LogPosition,
};

fn start_entry() -> LogEntry {
    LogEntry::Start {
        tx_id: 42,
        last_committed_tx_id: 41,
        timestamp: 1_700_000_000_000,
        leader_term: 0,
        additional_data: Vec::new(),
    }
}

/// Benchmark encoding command entries of growing size.
fn bench_encode_command(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_command");

    for size in [16, 256, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let entry = LogEntry::Command {
                payload: random_payload(size),
            };
            let mut buf = Vec::with_capacity(size + 16);

            b.iter(|| {
                buf.clear();
                encode_entry(black_box(&entry), &mut buf).unwrap();
                black_box(buf.len());
            });
        });
    }
    group.finish();
}

/// Benchmark decoding command entries in both formats.
fn bench_decode_command(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_command");

    for size in [16, 256, 4096, 65536].iter() {
        let entry = LogEntry::Command {
            payload: random_payload(*size),
        };
        let mut current = Vec::new();
        encode_entry(&entry, &mut current).unwrap();
        let mut legacy = Vec::new();
        encode_legacy_entry(&entry, 7, &mut legacy).unwrap();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("current", size), &current, |b, bytes| {
            b.iter(|| black_box(decode_entry(black_box(bytes), FormatVersion::Current).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("legacy", size), &legacy, |b, bytes| {
            b.iter(|| black_box(decode_entry(black_box(bytes), FormatVersion::Legacy).unwrap()));
        });
    }
    group.finish();
}

/// Benchmark the fixed-size entries written around every transaction.
fn bench_framing_entries(c: &mut Criterion) {
    let mut group = c.benchmark_group("framing");

    let commit = LogEntry::Commit {
        tx_id: 42,
        timestamp: 1_700_000_000_100,
        checksum: 0x5eed,
    };
    let checkpoint = LogEntry::Checkpoint {
        position: LogPosition::new(3, 4096),
        last_tx_id: 42,
        timestamp: 1_700_000_000_200,
        reason: "threshold reached".to_string(),
    };

    for (name, entry) in [("start", start_entry()), ("commit", commit), ("checkpoint", checkpoint)] {
        group.bench_function(name, |b| {
            let mut buf = Vec::new();
            b.iter(|| {
                buf.clear();
                encode_entry(black_box(&entry), &mut buf).unwrap();
                black_box(decode_entry(&buf, FormatVersion::Current).unwrap());
            });
        });
    }

    group.bench_function("header", |b| {
        let header = LogHeader::current(12, 3400);
        b.iter(|| {
            let bytes = black_box(header).encode();
            black_box(LogHeader::decode(&bytes).unwrap());
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_encode_command,
    bench_decode_command,
    bench_framing_entries,
);
criterion_main!(benches);
