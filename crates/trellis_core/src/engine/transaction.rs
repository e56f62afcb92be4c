//! Building graph store transactions.

use crate::engine::counts::{add_node, add_relationship, labels_of};
use crate::engine::graph::GraphStore;
use crate::engine::{CountsDelta, CountsKey, GraphCommand, NodeRecord, PropertyValue, RelationshipRecord};
use crate::error::{CoreError, CoreResult};
use std::collections::{BTreeMap, BTreeSet};

struct Change<T> {
    before: Option<T>,
    after: Option<T>,
}

/// Collects changes against a [`GraphStore`] and turns them into commands.
///
/// Nothing is visible in the store until the commands are committed
/// through the database. Ids are reserved immediately, so an abandoned
/// transaction leaves gaps.
pub struct GraphTransaction<'a> {
    store: &'a GraphStore,
    nodes: BTreeMap<u64, Change<NodeRecord>>,
    relationships: BTreeMap<u64, Change<RelationshipRecord>>,
}

impl<'a> GraphTransaction<'a> {
    pub(crate) fn new(store: &'a GraphStore) -> Self {
        Self {
            store,
            nodes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    /// Node `id` as this transaction sees it.
    #[must_use]
    pub fn node(&self, id: u64) -> Option<NodeRecord> {
        match self.nodes.get(&id) {
            Some(change) => change.after.clone(),
            None => self.store.node(id),
        }
    }

    /// Relationship `id` as this transaction sees it.
    #[must_use]
    pub fn relationship(&self, id: u64) -> Option<RelationshipRecord> {
        match self.relationships.get(&id) {
            Some(change) => change.after.clone(),
            None => self.store.relationship(id),
        }
    }

    /// Creates a node with `labels` and returns its id.
    pub fn create_node(&mut self, labels: impl IntoIterator<Item = u32>) -> u64 {
        let id = self.store.allocate_node_id();
        self.nodes.insert(
            id,
            Change {
                before: None,
                after: Some(NodeRecord {
                    id,
                    labels: labels.into_iter().collect(),
                    properties: BTreeMap::new(),
                }),
            },
        );
        id
    }

    /// Sets a property on node `id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the node does not exist.
    pub fn set_node_property(
        &mut self,
        id: u64,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> CoreResult<()> {
        let mut record = self
            .node(id)
            .ok_or_else(|| CoreError::invalid_operation(format!("node {id} does not exist")))?;
        record.properties.insert(key.into(), value);
        self.write_node(id, Some(record));
        Ok(())
    }

    /// Deletes node `id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the node does not exist or still has
    /// relationships.
    pub fn delete_node(&mut self, id: u64) -> CoreResult<()> {
        if self.node(id).is_none() {
            return Err(CoreError::invalid_operation(format!("node {id} does not exist")));
        }
        if let Some(rel) = self.attached_relationship(id) {
            return Err(CoreError::invalid_operation(format!(
                "node {id} still has relationship {rel}"
            )));
        }
        self.write_node(id, None);
        Ok(())
    }

    /// Creates a relationship and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if either node does not exist.
    pub fn create_relationship(&mut self, start: u64, rel_type: u32, end: u64) -> CoreResult<u64> {
        for node in [start, end] {
            if self.node(node).is_none() {
                return Err(CoreError::invalid_operation(format!(
                    "node {node} does not exist"
                )));
            }
        }
        let id = self.store.allocate_relationship_id();
        self.relationships.insert(
            id,
            Change {
                before: None,
                after: Some(RelationshipRecord {
                    id,
                    rel_type,
                    start,
                    end,
                    properties: BTreeMap::new(),
                }),
            },
        );
        Ok(id)
    }

    /// Sets a property on relationship `id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the relationship does not exist.
    pub fn set_relationship_property(
        &mut self,
        id: u64,
        key: impl Into<String>,
        value: PropertyValue,
    ) -> CoreResult<()> {
        let mut record = self.relationship(id).ok_or_else(|| {
            CoreError::invalid_operation(format!("relationship {id} does not exist"))
        })?;
        record.properties.insert(key.into(), value);
        self.write_relationship(id, Some(record));
        Ok(())
    }

    /// Deletes relationship `id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the relationship does not exist.
    pub fn delete_relationship(&mut self, id: u64) -> CoreResult<()> {
        if self.relationship(id).is_none() {
            return Err(CoreError::invalid_operation(format!(
                "relationship {id} does not exist"
            )));
        }
        self.write_relationship(id, None);
        Ok(())
    }

    fn write_node(&mut self, id: u64, after: Option<NodeRecord>) {
        let store = self.store;
        self.nodes
            .entry(id)
            .or_insert_with(|| {
                let before = store.node(id);
                Change {
                    after: before.clone(),
                    before,
                }
            })
            .after = after;
    }

    fn write_relationship(&mut self, id: u64, after: Option<RelationshipRecord>) {
        let store = self.store;
        self.relationships
            .entry(id)
            .or_insert_with(|| {
                let before = store.relationship(id);
                Change {
                    after: before.clone(),
                    before,
                }
            })
            .after = after;
    }

    fn attached_relationship(&self, node: u64) -> Option<u64> {
        let touches = |rel: &RelationshipRecord| rel.start == node || rel.end == node;
        let pending = self
            .relationships
            .iter()
            .filter_map(|(id, change)| change.after.as_ref().filter(|r| touches(*r)).map(|_| *id));
        let stored = self
            .store
            .read_records()
            .relationships
            .values()
            .filter(|r| !self.relationships.contains_key(&r.id) && touches(*r))
            .map(|r| r.id)
            .next();
        pending.chain(stored).next()
    }

    /// Labels of `node`, including a node this transaction deleted.
    fn labels(&self, node: u64) -> BTreeSet<u32> {
        match self.nodes.get(&node) {
            Some(change) => labels_of(change.before.as_ref().or(change.after.as_ref())),
            None => labels_of(self.store.node(node).as_ref()),
        }
    }

    fn counts_delta(&self) -> CountsDelta {
        let mut delta = CountsDelta::new();
        for change in self.nodes.values() {
            if let Some(before) = &change.before {
                add_node(&mut delta, &before.labels, -1);
            }
            if let Some(after) = &change.after {
                add_node(&mut delta, &after.labels, 1);
            }
        }
        for change in self.relationships.values() {
            for (image, sign) in [(&change.before, -1), (&change.after, 1)] {
                if let Some(rel) = image {
                    add_relationship(
                        &mut delta,
                        &self.labels(rel.start),
                        rel.rel_type,
                        &self.labels(rel.end),
                        sign,
                    );
                }
            }
        }
        delta
    }

    /// Encodes the collected changes: record commands first, then counts.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if a command cannot be serialized.
    pub fn into_commands(self) -> CoreResult<Vec<Vec<u8>>> {
        let delta = self.counts_delta();
        let mut commands = Vec::new();

        for (id, change) in self.nodes {
            if change.before != change.after {
                commands.push(
                    GraphCommand::Node {
                        id,
                        before: change.before,
                        after: change.after,
                    }
                    .encode()?,
                );
            }
        }
        for (id, change) in self.relationships {
            if change.before != change.after {
                commands.push(
                    GraphCommand::Relationship {
                        id,
                        before: change.before,
                        after: change.after,
                    }
                    .encode()?,
                );
            }
        }
        for (key, change) in delta.iter() {
            let command = match *key {
                CountsKey::Node { label } => GraphCommand::NodeCount {
                    label,
                    delta: *change,
                },
                CountsKey::Relationship {
                    start,
                    rel_type,
                    end,
                } => GraphCommand::RelationshipCount {
                    start,
                    rel_type,
                    end,
                    delta: *change,
                },
            };
            commands.push(command.encode()?);
        }
        Ok(commands)
    }
}
