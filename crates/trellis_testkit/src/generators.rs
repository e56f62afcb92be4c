//! Property-based test generators using proptest.
//!
//! Provides strategies for generating graph workloads. Operations refer
//! to nodes and relationships by index into what exists when they run, so
//! every generated workload can be applied to any store.

use proptest::prelude::*;
use trellis_core::{CoreResult, GraphTransaction, PropertyValue};

/// Number of distinct labels and relationship types generated.
pub const TOKEN_COUNT: u32 = 6;

/// One change to the graph.
#[derive(Debug, Clone)]
pub enum GraphOp {
    /// Create a node.
    CreateNode {
        /// Node labels.
        labels: Vec<u32>,
    },
    /// Connect two existing nodes.
    Connect {
        /// Index of the start node.
        start: usize,
        /// Relationship type.
        rel_type: u32,
        /// Index of the end node.
        end: usize,
    },
    /// Set a property on an existing node.
    SetProperty {
        /// Index of the node.
        node: usize,
        /// Property key.
        key: String,
        /// Property value.
        value: i64,
    },
    /// Delete an existing relationship.
    Disconnect {
        /// Index of the relationship.
        relationship: usize,
    },
    /// Delete an existing node; skipped while it has relationships.
    DeleteNode {
        /// Index of the node.
        node: usize,
    },
}

/// Strategy for generating a label or relationship type.
pub fn token_strategy() -> impl Strategy<Value = u32> {
    0..TOKEN_COUNT
}

/// Strategy for generating node labels.
pub fn labels_strategy() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::btree_set(token_strategy(), 0..3).prop_map(|set| set.into_iter().collect())
}

/// Strategy for generating property keys.
pub fn property_key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for generating a single operation.
pub fn graph_op_strategy() -> impl Strategy<Value = GraphOp> {
    prop_oneof![
        3 => labels_strategy().prop_map(|labels| GraphOp::CreateNode { labels }),
        2 => (any::<usize>(), token_strategy(), any::<usize>())
            .prop_map(|(start, rel_type, end)| GraphOp::Connect { start, rel_type, end }),
        2 => (any::<usize>(), property_key_strategy(), any::<i64>())
            .prop_map(|(node, key, value)| GraphOp::SetProperty { node, key, value }),
        1 => any::<usize>().prop_map(|relationship| GraphOp::Disconnect { relationship }),
        1 => any::<usize>().prop_map(|node| GraphOp::DeleteNode { node }),
    ]
}

/// Strategy for generating the operations of one transaction.
pub fn transaction_strategy() -> impl Strategy<Value = Vec<GraphOp>> {
    prop::collection::vec(graph_op_strategy(), 1..6)
}

/// Strategy for generating a sequence of transactions.
pub fn workload_strategy(max_transactions: usize) -> impl Strategy<Value = Vec<Vec<GraphOp>>> {
    prop::collection::vec(transaction_strategy(), 1..=max_transactions.max(1))
}

/// Ids of the nodes and relationships a workload has created so far.
#[derive(Debug, Clone, Default)]
pub struct WorkloadState {
    /// Live node ids.
    pub nodes: Vec<u64>,
    /// Live relationship ids.
    pub relationships: Vec<(u64, u64, u64)>,
}

impl WorkloadState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    fn node_at(&self, index: usize) -> Option<u64> {
        (!self.nodes.is_empty()).then(|| self.nodes[index % self.nodes.len()])
    }
}

/// Applies `ops` to `tx`, skipping operations with nothing to act on.
///
/// `state` is updated as if the transaction commits.
///
/// # Errors
///
/// Returns an error only if the transaction rejects an operation that
/// `state` says is valid.
pub fn apply_ops(
    tx: &mut GraphTransaction<'_>,
    ops: &[GraphOp],
    state: &mut WorkloadState,
) -> CoreResult<()> {
    for op in ops {
        match op {
            GraphOp::CreateNode { labels } => {
                let id = tx.create_node(labels.iter().copied());
                state.nodes.push(id);
            }
            GraphOp::Connect {
                start,
                rel_type,
                end,
            } => {
                if let (Some(start), Some(end)) = (state.node_at(*start), state.node_at(*end)) {
                    let id = tx.create_relationship(start, *rel_type, end)?;
                    state.relationships.push((id, start, end));
                }
            }
            GraphOp::SetProperty { node, key, value } => {
                if let Some(node) = state.node_at(*node) {
                    tx.set_node_property(node, key.clone(), PropertyValue::Int(*value))?;
                }
            }
            GraphOp::Disconnect { relationship } => {
                if !state.relationships.is_empty() {
                    let index = relationship % state.relationships.len();
                    let (id, _, _) = state.relationships.remove(index);
                    tx.delete_relationship(id)?;
                }
            }
            GraphOp::DeleteNode { node } => {
                let Some(id) = state.node_at(*node) else {
                    continue;
                };
                let attached = state
                    .relationships
                    .iter()
                    .any(|&(_, start, end)| start == id || end == id);
                if !attached {
                    tx.delete_node(id)?;
                    state.nodes.retain(|&n| n != id);
                }
            }
        }
    }
    Ok(())
}
