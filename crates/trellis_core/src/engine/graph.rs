//! The reference graph store.

use crate::dir::DatabaseLayout;
use crate::engine::counts::{add_node, add_relationship};
use crate::engine::snapshot::{seal, unseal, FileSnapshot, MemorySnapshot, SnapshotSlot};
use crate::engine::transaction::GraphTransaction;
use crate::engine::{
    ApplyError, ApplyMode, CommandBatch, CountsDelta, CountsKey, CountsSnapshot, CountsState,
    GraphCommand, NodeRecord, RelationshipRecord, StorageEngine,
};
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const PRIMARY_KIND: u8 = 1;
const COUNTS_KIND: u8 = 2;

#[derive(Debug, Default)]
pub(crate) struct Records {
    pub(crate) nodes: BTreeMap<u64, NodeRecord>,
    pub(crate) relationships: BTreeMap<u64, RelationshipRecord>,
    pub(crate) last_applied: u64,
}

#[derive(Debug)]
struct CountsTable {
    tx_id: u64,
    counts: BTreeMap<CountsKey, i64>,
    consistent: bool,
}

impl CountsTable {
    fn apply(&mut self, delta: &CountsDelta) {
        for (key, change) in delta.iter() {
            let value = self.counts.entry(*key).or_insert(0);
            *value += change;
            if *value == 0 {
                self.counts.remove(key);
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PrimaryImage {
    last_applied: u64,
    nodes: Vec<NodeRecord>,
    relationships: Vec<RelationshipRecord>,
}

#[derive(Serialize, Deserialize)]
struct CountsImage {
    tx_id: u64,
    clean: bool,
    counts: Vec<(CountsKey, i64)>,
}

/// In-memory graph with snapshot files for records and counts.
///
/// Records and counts are written to separate slots and may be flushed
/// independently, so after a crash either can be older than the other.
/// The counts slot carries its own transaction id and a clean flag that
/// recovery uses to decide between merging replayed deltas and rebuilding.
pub struct GraphStore {
    primary_slot: Box<dyn SnapshotSlot>,
    counts_slot: Box<dyn SnapshotSlot>,
    records: RwLock<Records>,
    counts: RwLock<CountsTable>,
    next_node_id: AtomicU64,
    next_relationship_id: AtomicU64,
}

impl GraphStore {
    /// Opens the store files of a database directory.
    ///
    /// # Errors
    ///
    /// Returns `CorruptStore` if the primary store file is damaged.
    pub fn open(layout: &DatabaseLayout) -> CoreResult<Self> {
        Self::with_slots(
            Box::new(FileSnapshot::new(layout.primary_store_path())),
            Box::new(FileSnapshot::new(layout.counts_store_path())),
        )
    }

    /// Creates an empty store held in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::empty(Box::new(MemorySnapshot::new()), Box::new(MemorySnapshot::new()))
    }

    /// Opens a store on explicit snapshot slots.
    ///
    /// A missing or damaged counts snapshot is not an error: the counts are
    /// flagged inconsistent and rebuilt by recovery.
    ///
    /// # Errors
    ///
    /// Returns `CorruptStore` if the primary snapshot is damaged.
    pub fn with_slots(
        primary_slot: Box<dyn SnapshotSlot>,
        counts_slot: Box<dyn SnapshotSlot>,
    ) -> CoreResult<Self> {
        let store = Self::empty(primary_slot, counts_slot);
        let primary_present = store.load_primary()?;
        store.load_counts(primary_present)?;
        Ok(store)
    }

    fn empty(primary_slot: Box<dyn SnapshotSlot>, counts_slot: Box<dyn SnapshotSlot>) -> Self {
        Self {
            primary_slot,
            counts_slot,
            records: RwLock::new(Records::default()),
            counts: RwLock::new(CountsTable {
                tx_id: 0,
                counts: BTreeMap::new(),
                consistent: true,
            }),
            next_node_id: AtomicU64::new(0),
            next_relationship_id: AtomicU64::new(0),
        }
    }

    fn load_primary(&self) -> CoreResult<bool> {
        let Some(bytes) = self.primary_slot.load()? else {
            return Ok(false);
        };
        let body = unseal(PRIMARY_KIND, &bytes)?;
        let image: PrimaryImage = ciborium::de::from_reader(body)
            .map_err(|e| CoreError::corrupt_store(format!("primary store: {e}")))?;

        let mut records = self.records.write();
        records.last_applied = image.last_applied;
        records.nodes = image.nodes.into_iter().map(|n| (n.id, n)).collect();
        records.relationships = image
            .relationships
            .into_iter()
            .map(|r| (r.id, r))
            .collect();
        self.bump_ids(&records);
        debug!(
            last_applied = records.last_applied,
            nodes = records.nodes.len(),
            relationships = records.relationships.len(),
            "loaded primary store"
        );
        Ok(true)
    }

    fn load_counts(&self, primary_present: bool) -> CoreResult<()> {
        let mut table = self.counts.write();
        let bytes = match self.counts_slot.load() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "counts store unreadable, counts will be rebuilt");
                table.consistent = false;
                return Ok(());
            }
        };
        let Some(bytes) = bytes else {
            if primary_present {
                warn!("counts store missing, counts will be rebuilt");
                table.consistent = false;
            }
            return Ok(());
        };

        let image = unseal(COUNTS_KIND, &bytes).and_then(|body| {
            ciborium::de::from_reader::<CountsImage, _>(body)
                .map_err(|e| CoreError::corrupt_store(format!("counts store: {e}")))
        });
        match image {
            Ok(image) => {
                table.tx_id = image.tx_id;
                table.consistent = image.clean;
                table.counts = image.counts.into_iter().collect();
                if !image.clean {
                    warn!("counts store was not closed cleanly, counts will be rebuilt");
                }
            }
            Err(err) => {
                warn!(error = %err, "counts store damaged, counts will be rebuilt");
                table.consistent = false;
            }
        }
        Ok(())
    }

    fn bump_ids(&self, records: &Records) {
        if let Some(id) = records.nodes.keys().next_back() {
            self.next_node_id.fetch_max(id + 1, Ordering::SeqCst);
        }
        if let Some(id) = records.relationships.keys().next_back() {
            self.next_relationship_id.fetch_max(id + 1, Ordering::SeqCst);
        }
    }

    /// Starts building a transaction against the current state.
    #[must_use]
    pub fn begin(&self) -> GraphTransaction<'_> {
        GraphTransaction::new(self)
    }

    pub(crate) fn allocate_node_id(&self) -> u64 {
        self.next_node_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn allocate_relationship_id(&self) -> u64 {
        self.next_relationship_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn read_records(&self) -> parking_lot::RwLockReadGuard<'_, Records> {
        self.records.read()
    }

    /// Returns the node with `id`.
    #[must_use]
    pub fn node(&self, id: u64) -> Option<NodeRecord> {
        self.records.read().nodes.get(&id).cloned()
    }

    /// Returns the relationship with `id`.
    #[must_use]
    pub fn relationship(&self, id: u64) -> Option<RelationshipRecord> {
        self.records.read().relationships.get(&id).cloned()
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.records.read().nodes.len()
    }

    /// Number of relationships.
    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.records.read().relationships.len()
    }

    /// Writes the record snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn flush_primary(&self) -> CoreResult<()> {
        let body = self.encode_primary()?;
        self.primary_slot.store(&seal(PRIMARY_KIND, &body))
    }

    /// Writes the counts snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn flush_counts(&self) -> CoreResult<()> {
        let body = self.encode_counts(true)?;
        self.counts_slot.store(&seal(COUNTS_KIND, &body))
    }

    /// Marks the stored counts as untrustworthy so that the next recovery
    /// rebuilds them from the records.
    ///
    /// # Errors
    ///
    /// Returns an error if the counts snapshot cannot be written.
    pub fn invalidate_counts(&self) -> CoreResult<()> {
        self.counts.write().consistent = false;
        let body = self.encode_counts(false)?;
        self.counts_slot.store(&seal(COUNTS_KIND, &body))
    }

    /// Deterministic encoding of the records and counts.
    ///
    /// Two stores holding the same state produce the same bytes.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if serialization fails.
    pub fn encoded_state(&self) -> CoreResult<Vec<u8>> {
        let mut out = self.encode_primary()?;
        out.extend(self.encode_counts(true)?);
        Ok(out)
    }

    fn encode_primary(&self) -> CoreResult<Vec<u8>> {
        let records = self.records.read();
        let image = PrimaryImage {
            last_applied: records.last_applied,
            nodes: records.nodes.values().cloned().collect(),
            relationships: records.relationships.values().cloned().collect(),
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&image, &mut buf)
            .map_err(|e| CoreError::encoding(format!("primary store: {e}")))?;
        Ok(buf)
    }

    fn encode_counts(&self, clean: bool) -> CoreResult<Vec<u8>> {
        let table = self.counts.read();
        let image = CountsImage {
            tx_id: table.tx_id,
            clean: clean && table.consistent,
            counts: table.counts.iter().map(|(k, v)| (*k, *v)).collect(),
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&image, &mut buf)
            .map_err(|e| CoreError::encoding(format!("counts store: {e}")))?;
        Ok(buf)
    }
}

impl StorageEngine for GraphStore {
    fn apply(&self, batch: &CommandBatch<'_>, mode: ApplyMode) -> Result<CountsDelta, ApplyError> {
        let commands = batch
            .commands
            .iter()
            .map(|bytes| GraphCommand::decode(bytes))
            .collect::<Result<Vec<_>, _>>()?;

        let mut delta = CountsDelta::new();
        let mut records = self.records.write();
        for command in commands {
            match command {
                GraphCommand::Node { id, after, .. } => {
                    if let Some(record) = &after {
                        if record.id != id {
                            return Err(ApplyError::InvalidCommand {
                                message: format!("node command {id} carries record {}", record.id),
                            });
                        }
                    }
                    match after {
                        Some(record) => {
                            self.next_node_id.fetch_max(id + 1, Ordering::SeqCst);
                            records.nodes.insert(id, record);
                        }
                        None => {
                            records.nodes.remove(&id);
                        }
                    }
                }
                GraphCommand::Relationship { id, after, .. } => match after {
                    Some(record) => {
                        if record.id != id {
                            return Err(ApplyError::InvalidCommand {
                                message: format!(
                                    "relationship command {id} carries record {}",
                                    record.id
                                ),
                            });
                        }
                        self.next_relationship_id.fetch_max(id + 1, Ordering::SeqCst);
                        records.relationships.insert(id, record);
                    }
                    None => {
                        records.relationships.remove(&id);
                    }
                },
                GraphCommand::NodeCount { label, delta: change } => {
                    delta.add(CountsKey::node(label), change);
                }
                GraphCommand::RelationshipCount {
                    start,
                    rel_type,
                    end,
                    delta: change,
                } => {
                    delta.add(CountsKey::relationship(start, rel_type, end), change);
                }
            }
        }
        records.last_applied = records.last_applied.max(batch.tx_id);
        drop(records);

        if mode == ApplyMode::Normal {
            let mut table = self.counts.write();
            table.apply(&delta);
            table.tx_id = table.tx_id.max(batch.tx_id);
        }
        Ok(delta)
    }

    fn flush_and_force(&self) -> CoreResult<()> {
        self.flush_primary()?;
        self.flush_counts()
    }

    fn last_applied_transaction_id(&self) -> u64 {
        self.records.read().last_applied
    }

    fn counts_state(&self) -> CountsState {
        let table = self.counts.read();
        CountsState {
            tx_id: table.tx_id,
            consistent: table.consistent,
        }
    }

    fn counts_snapshot(&self) -> CountsSnapshot {
        let table = self.counts.read();
        CountsSnapshot {
            tx_id: table.tx_id,
            counts: table.counts.clone(),
        }
    }

    fn merge_counts(&self, delta: &CountsDelta, up_to_tx_id: u64) -> CoreResult<()> {
        let mut table = self.counts.write();
        table.apply(delta);
        table.tx_id = table.tx_id.max(up_to_tx_id);
        Ok(())
    }

    fn rebuild_counts(&self) -> CoreResult<()> {
        let records = self.records.read();
        let mut delta = CountsDelta::new();
        for node in records.nodes.values() {
            add_node(&mut delta, &node.labels, 1);
        }
        for rel in records.relationships.values() {
            let start = records.nodes.get(&rel.start).map(|n| &n.labels);
            let end = records.nodes.get(&rel.end).map(|n| &n.labels);
            let (Some(start), Some(end)) = (start, end) else {
                return Err(CoreError::corrupt_store(format!(
                    "relationship {} refers to a missing node",
                    rel.id
                )));
            };
            add_relationship(&mut delta, start, rel.rel_type, end, 1);
        }

        let mut table = self.counts.write();
        table.counts = delta.iter().map(|(k, v)| (*k, *v)).collect();
        table.tx_id = records.last_applied;
        table.consistent = true;
        info!(
            keys = table.counts.len(),
            tx_id = table.tx_id,
            "rebuilt counts from records"
        );
        Ok(())
    }
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = self.records.read();
        f.debug_struct("GraphStore")
            .field("nodes", &records.nodes.len())
            .field("relationships", &records.relationships.len())
            .field("last_applied", &records.last_applied)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NO_TOKEN;

    fn commit(store: &GraphStore, tx_id: u64, commands: &[Vec<u8>], mode: ApplyMode) -> CountsDelta {
        store
            .apply(
                &CommandBatch {
                    tx_id,
                    timestamp: 0,
                    commands,
                },
                mode,
            )
            .unwrap()
    }

    #[test]
    fn normal_apply_updates_records_and_counts() {
        let store = GraphStore::in_memory();
        let mut tx = store.begin();
        let a = tx.create_node([1]);
        let b = tx.create_node([2]);
        tx.create_relationship(a, 7, b).unwrap();
        let commands = tx.into_commands().unwrap();

        commit(&store, 1, &commands, ApplyMode::Normal);

        assert_eq!(store.node_count(), 2);
        assert_eq!(store.last_applied_transaction_id(), 1);
        let counts = store.counts_snapshot();
        assert_eq!(counts.node_count(NO_TOKEN), 2);
        assert_eq!(counts.node_count(1), 1);
        assert_eq!(counts.relationship_count(1, 7, NO_TOKEN), 1);
        assert_eq!(counts.tx_id, 1);
    }

    #[test]
    fn recovery_apply_is_idempotent_and_leaves_counts() {
        let store = GraphStore::in_memory();
        let mut tx = store.begin();
        tx.create_node([1]);
        let commands = tx.into_commands().unwrap();

        let first = commit(&store, 1, &commands, ApplyMode::Recovery);
        let state = store.encoded_state().unwrap();
        let second = commit(&store, 1, &commands, ApplyMode::Recovery);

        assert_eq!(first, second);
        assert_eq!(store.encoded_state().unwrap(), state);
        assert_eq!(store.counts_snapshot().node_count(NO_TOKEN), 0);
        assert_eq!(first.get(&CountsKey::node(1)), 1);
    }

    #[test]
    fn snapshots_survive_reopen() {
        let primary = MemorySnapshot::new();
        let counts = MemorySnapshot::new();
        let store =
            GraphStore::with_slots(Box::new(primary.clone()), Box::new(counts.clone())).unwrap();
        let mut tx = store.begin();
        tx.create_node([3]);
        commit(&store, 1, &tx.into_commands().unwrap(), ApplyMode::Normal);
        store.flush_and_force().unwrap();

        let reopened = GraphStore::with_slots(Box::new(primary), Box::new(counts)).unwrap();
        assert_eq!(reopened.last_applied_transaction_id(), 1);
        assert_eq!(reopened.counts_snapshot().node_count(3), 1);
        assert!(reopened.counts_state().consistent);
        // Ids continue after the loaded records.
        assert_eq!(reopened.allocate_node_id(), 1);
    }

    #[test]
    fn missing_counts_beside_primary_is_inconsistent() {
        let primary = MemorySnapshot::new();
        let store =
            GraphStore::with_slots(Box::new(primary.clone()), Box::new(MemorySnapshot::new()))
                .unwrap();
        store.flush_primary().unwrap();

        let reopened =
            GraphStore::with_slots(Box::new(primary), Box::new(MemorySnapshot::new())).unwrap();
        assert!(!reopened.counts_state().consistent);
    }

    #[test]
    fn damaged_counts_are_inconsistent_damaged_primary_is_fatal() {
        let primary = MemorySnapshot::new();
        let counts = MemorySnapshot::new();
        let store =
            GraphStore::with_slots(Box::new(primary.clone()), Box::new(counts.clone())).unwrap();
        store.flush_and_force().unwrap();

        counts.set_raw(Some(b"garbage".to_vec()));
        let reopened =
            GraphStore::with_slots(Box::new(primary.clone()), Box::new(counts.clone())).unwrap();
        assert!(!reopened.counts_state().consistent);

        primary.set_raw(Some(b"garbage".to_vec()));
        let result = GraphStore::with_slots(Box::new(primary), Box::new(counts));
        assert!(matches!(result, Err(CoreError::CorruptStore { .. })));
    }

    #[test]
    fn rebuild_counts_from_records() {
        let store = GraphStore::in_memory();
        let mut tx = store.begin();
        let a = tx.create_node([1]);
        let b = tx.create_node([2]);
        tx.create_relationship(a, 7, b).unwrap();
        commit(&store, 1, &tx.into_commands().unwrap(), ApplyMode::Recovery);
        assert_eq!(store.counts_snapshot().node_count(NO_TOKEN), 0);

        store.rebuild_counts().unwrap();
        let counts = store.counts_snapshot();
        assert_eq!(counts.node_count(NO_TOKEN), 2);
        assert_eq!(counts.relationship_count(NO_TOKEN, 7, 2), 1);
        assert_eq!(counts.tx_id, 1);
    }

    #[test]
    fn undecodable_command_changes_nothing() {
        let store = GraphStore::in_memory();
        let mut tx = store.begin();
        tx.create_node([1]);
        let mut commands = tx.into_commands().unwrap();
        commands.push(vec![0xff]);

        let result = store.apply(
            &CommandBatch {
                tx_id: 1,
                timestamp: 0,
                commands: &commands,
            },
            ApplyMode::Normal,
        );
        assert!(matches!(result, Err(ApplyError::Decode { .. })));
        assert_eq!(store.node_count(), 0);
        assert_eq!(store.last_applied_transaction_id(), 0);
    }
}
