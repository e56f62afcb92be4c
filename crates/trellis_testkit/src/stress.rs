//! Stress tests for Trellis.
//!
//! These tests verify commit behavior under heavy load and concurrent
//! access.

use crate::fixtures::TestDatabase;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use trellis_core::Config;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total commits attempted.
    pub total_ops: usize,
    /// Successful commits.
    pub successful_ops: usize,
    /// Failed commits.
    pub failed_ops: usize,
    /// Log flushes performed during the run.
    pub flushes: u64,
    /// Total duration.
    pub duration: Duration,
    /// Commits per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, flushes: u64, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            flushes,
            duration,
            ops_per_second,
        }
    }

    /// Average number of commits made durable by one flush.
    pub fn commits_per_flush(&self) -> f64 {
        if self.flushes == 0 {
            0.0
        } else {
            self.successful_ops as f64 / self.flushes as f64
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total commits: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Flushes: {}", self.flushes);
        println!("Commits per flush: {:.2}", self.commits_per_flush());
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} commits/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of commits to perform.
    pub operations: usize,
    /// Number of concurrent threads (for concurrent tests).
    pub threads: usize,
    /// Nodes created per commit.
    pub nodes_per_commit: usize,
    /// Group commit window.
    pub group_commit_window: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            nodes_per_commit: 1,
            group_commit_window: Duration::ZERO,
        }
    }
}

impl StressConfig {
    fn database(&self) -> TestDatabase {
        TestDatabase::memory_with(
            Config::default()
                .checkpoint_on_close(false)
                .group_commit_window(self.group_commit_window),
        )
    }
}

fn commit_nodes(db: &TestDatabase, count: usize, label: u32) -> bool {
    db.commit_with(|tx| {
        for _ in 0..count {
            tx.create_node([label]);
        }
        Ok(())
    })
    .is_ok()
}

/// Run a sequential commit stress test.
pub fn stress_sequential_commits(config: &StressConfig) -> StressTestResult {
    let db = config.database();
    let flushes_before = db.log_force_count();

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        if commit_nodes(&db, config.nodes_per_commit, (i % 4) as u32) {
            successful += 1;
        } else {
            failed += 1;
        }
    }

    StressTestResult::new(
        successful,
        failed,
        db.log_force_count() - flushes_before,
        start.elapsed(),
    )
}

/// Run a concurrent commit stress test; commits from different threads
/// share flushes through group commit.
pub fn stress_concurrent_commits(config: &StressConfig) -> StressTestResult {
    let db = Arc::new(config.database());
    let flushes_before = db.log_force_count();
    let per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();
    let handles: Vec<_> = (0..config.threads.max(1))
        .map(|thread_id| {
            let db = Arc::clone(&db);
            let nodes = config.nodes_per_commit;
            thread::spawn(move || {
                let mut successful = 0usize;
                let mut failed = 0usize;
                for _ in 0..per_thread {
                    if commit_nodes(&db, nodes, thread_id as u32) {
                        successful += 1;
                    } else {
                        failed += 1;
                    }
                }
                (successful, failed)
            })
        })
        .collect();

    let (successful, failed) = handles
        .into_iter()
        .map(|h| h.join().unwrap_or((0, per_thread)))
        .fold((0, 0), |(s, f), (hs, hf)| (s + hs, f + hf));

    StressTestResult::new(
        successful,
        failed,
        db.log_force_count() - flushes_before,
        start.elapsed(),
    )
}

/// Run a commit stress test with checkpoints forced between batches.
pub fn stress_commits_with_checkpoints(
    config: &StressConfig,
    checkpoint_every: usize,
) -> StressTestResult {
    let db = config.database();
    let flushes_before = db.log_force_count();

    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        if commit_nodes(&db, config.nodes_per_commit, 0) {
            successful += 1;
        } else {
            failed += 1;
        }
        if checkpoint_every > 0 && (i + 1) % checkpoint_every == 0 && db.checkpoint("stress").is_err() {
            failed += 1;
        }
    }

    StressTestResult::new(
        successful,
        failed,
        db.log_force_count() - flushes_before,
        start.elapsed(),
    )
}
