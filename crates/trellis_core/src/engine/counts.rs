//! Which counts a record contributes to.

use crate::engine::{CountsDelta, CountsKey, NodeRecord, NO_TOKEN};
use std::collections::BTreeSet;

/// Adds `sign` for a node with `labels`: once to the all-nodes count and
/// once per label.
pub(crate) fn add_node(delta: &mut CountsDelta, labels: &BTreeSet<u32>, sign: i64) {
    delta.add(CountsKey::node(NO_TOKEN), sign);
    for label in labels {
        delta.add(CountsKey::node(*label), sign);
    }
}

/// Adds `sign` for a relationship of `rel_type` between nodes carrying
/// `start_labels` and `end_labels`.
///
/// Only keys with at most one label are maintained: the any/any/any count,
/// the per-type count, and per-label counts on either side with and
/// without the type.
pub(crate) fn add_relationship(
    delta: &mut CountsDelta,
    start_labels: &BTreeSet<u32>,
    rel_type: u32,
    end_labels: &BTreeSet<u32>,
    sign: i64,
) {
    delta.add(CountsKey::relationship(NO_TOKEN, NO_TOKEN, NO_TOKEN), sign);
    delta.add(CountsKey::relationship(NO_TOKEN, rel_type, NO_TOKEN), sign);
    for label in start_labels {
        delta.add(CountsKey::relationship(*label, NO_TOKEN, NO_TOKEN), sign);
        delta.add(CountsKey::relationship(*label, rel_type, NO_TOKEN), sign);
    }
    for label in end_labels {
        delta.add(CountsKey::relationship(NO_TOKEN, NO_TOKEN, *label), sign);
        delta.add(CountsKey::relationship(NO_TOKEN, rel_type, *label), sign);
    }
}

/// Labels of `node`, or none if it is unknown.
pub(crate) fn labels_of(node: Option<&NodeRecord>) -> BTreeSet<u32> {
    node.map(|n| n.labels.clone()).unwrap_or_default()
}
