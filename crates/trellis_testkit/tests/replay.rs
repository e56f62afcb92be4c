//! Property tests: recovery rebuilds exactly the state normal operation
//! produced.

use proptest::prelude::*;
use trellis_core::{Config, StorageEngine};
use trellis_testkit::prelude::*;

fn config() -> Config {
    Config::default().checkpoint_on_close(false)
}

fn run_workload(db: &TestDatabase, workload: &[Vec<GraphOp>], checkpoint_at: usize) {
    let mut state = WorkloadState::new();
    for (i, ops) in workload.iter().enumerate() {
        if i == checkpoint_at {
            db.checkpoint("workload").unwrap();
        }
        let mut next = state.clone();
        db.commit_with(|tx| apply_ops(tx, ops, &mut next)).unwrap();
        state = next;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn recovery_reproduces_the_committed_state(
        workload in workload_strategy(12),
        checkpoint_at in 0usize..16,
    ) {
        let db = TestDatabase::memory_with(config());
        run_workload(&db, &workload, checkpoint_at);
        let image = db.crash_image();

        let recovered = image.open(config()).unwrap();
        prop_assert_eq!(
            recovered.last_committed_transaction_id(),
            db.last_committed_transaction_id()
        );
        prop_assert_eq!(
            recovered.engine.encoded_state().unwrap(),
            db.engine.encoded_state().unwrap()
        );
        prop_assert_eq!(recovered.engine.counts_snapshot(), db.engine.counts_snapshot());
    }

    #[test]
    fn damaged_counts_are_rebuilt_to_the_same_values(workload in workload_strategy(8)) {
        let db = TestDatabase::memory_with(config());
        run_workload(&db, &workload, usize::MAX);
        let image = db.crash_image();
        image.counts.set_raw(Some(vec![0xde, 0xad]));

        let recovered = image.open(config()).unwrap();
        prop_assert_eq!(
            recovered.engine.counts_snapshot().counts,
            db.engine.counts_snapshot().counts
        );
    }
}
