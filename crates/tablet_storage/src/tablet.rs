//! Tablet: the store set of one shard plus its key partitioning.
//!
//! ```text
//!  Tablet
//!  ├── active store           (receives writes)
//!  ├── Eden   [Min, Max)      dynamic stores + freshly flushed chunks
//!  └── partitions             [Min, p1) [p1, p2) ... [pn, Max)
//!                             compacted chunks, sample keys
//! ```
//!
//! The tablet is mutated only by its store manager on the apply thread.
//! After every structural change it publishes an immutable
//! [`TabletSnapshot`]; readers work off a snapshot and never block writers.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use tablet_common::config::TabletManagerConfig;
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::schema::TableSchema;
use tablet_common::types::{PartitionId, StoreId, TabletId};

use crate::comparer::{KeyBound, RowKey};
use crate::store::{Store, StoreState};

/// Partition id reserved for Eden.
pub const EDEN_PARTITION_ID: PartitionId = PartitionId(0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    /// Inclusive lower key of the partition.
    pub pivot_key: KeyBound,
    /// Exclusive upper key.
    pub next_pivot_key: KeyBound,
    pub store_ids: Vec<StoreId>,
    pub sample_keys: Vec<RowKey>,
}

impl Partition {
    fn new(id: PartitionId, pivot_key: KeyBound, next_pivot_key: KeyBound) -> Self {
        Self {
            id,
            pivot_key,
            next_pivot_key,
            store_ids: Vec::new(),
            sample_keys: Vec::new(),
        }
    }

    pub fn is_eden(&self) -> bool {
        self.id == EDEN_PARTITION_ID
    }

    /// True when `[min_key, max_key]` lies within `[pivot, next_pivot)`.
    pub fn contains_range(&self, min_key: &KeyBound, max_key: &KeyBound) -> bool {
        self.pivot_key <= *min_key && *max_key < self.next_pivot_key
    }
}

/// Read-only view of one partition.
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    pub id: PartitionId,
    pub pivot_key: KeyBound,
    pub next_pivot_key: KeyBound,
    pub stores: Vec<Store>,
    pub sample_keys: Vec<RowKey>,
}

/// Everything a reader needs, frozen at publication time.
#[derive(Debug, Clone)]
pub struct TabletSnapshot {
    pub tablet_id: TabletId,
    pub schema: Arc<TableSchema>,
    pub config: Arc<TabletManagerConfig>,
    pub eden: PartitionSnapshot,
    pub partitions: Vec<PartitionSnapshot>,
    pub active_store: Option<Store>,
    /// Ordered stores by starting row index.
    pub ordered_stores: Vec<Store>,
}

pub struct Tablet {
    id: TabletId,
    schema: Arc<TableSchema>,
    config: Arc<TabletManagerConfig>,
    stores: BTreeMap<StoreId, Store>,
    active_store: Option<Store>,
    eden: Partition,
    partitions: Vec<Partition>,
    next_store_id: u64,
    next_partition_id: u64,
    snapshot: ArcSwap<TabletSnapshot>,
}

impl Tablet {
    pub fn new(id: TabletId, schema: Arc<TableSchema>, config: Arc<TabletManagerConfig>) -> Self {
        let eden = Partition::new(EDEN_PARTITION_ID, KeyBound::Min, KeyBound::Max);
        let partitions = vec![Partition::new(PartitionId(1), KeyBound::Min, KeyBound::Max)];
        let snapshot = ArcSwap::from_pointee(TabletSnapshot {
            tablet_id: id,
            schema: schema.clone(),
            config: config.clone(),
            eden: PartitionSnapshot {
                id: EDEN_PARTITION_ID,
                pivot_key: KeyBound::Min,
                next_pivot_key: KeyBound::Max,
                stores: Vec::new(),
                sample_keys: Vec::new(),
            },
            partitions: Vec::new(),
            active_store: None,
            ordered_stores: Vec::new(),
        });
        let tablet = Self {
            id,
            schema,
            config,
            stores: BTreeMap::new(),
            active_store: None,
            eden,
            partitions,
            next_store_id: 1,
            next_partition_id: 2,
            snapshot,
        };
        tablet.publish_snapshot();
        tablet
    }

    /// Rebuilds a tablet from a saved store layout.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: TabletId,
        schema: Arc<TableSchema>,
        config: Arc<TabletManagerConfig>,
        eden: Partition,
        partitions: Vec<Partition>,
        stores: Vec<Store>,
        active_store_id: Option<StoreId>,
        next_store_id: StoreId,
        next_partition_id: PartitionId,
    ) -> TabletResult<Self> {
        let stores: BTreeMap<StoreId, Store> = stores.into_iter().map(|s| (s.id(), s)).collect();
        for store_id in eden.store_ids.iter().chain(partitions.iter().flat_map(|p| p.store_ids.iter())) {
            if !stores.contains_key(store_id) {
                return Err(TabletError::SnapshotCorrupted(format!(
                    "partition layout of {} references missing store {}",
                    id, store_id
                )));
            }
        }
        let active_store = match active_store_id {
            Some(store_id) => Some(stores.get(&store_id).cloned().ok_or_else(|| {
                TabletError::SnapshotCorrupted(format!("active store {} of {} is missing", store_id, id))
            })?),
            None => None,
        };
        let mut tablet = Self::new(id, schema, config);
        tablet.stores = stores;
        tablet.active_store = active_store;
        tablet.eden = eden;
        tablet.partitions = partitions;
        tablet.next_store_id = next_store_id.0;
        tablet.next_partition_id = next_partition_id.0;
        let max_store_id = tablet.stores.keys().next_back().copied();
        if let Some(max) = max_store_id {
            tablet.reserve_store_id(max);
        }
        tablet.publish_snapshot();
        Ok(tablet)
    }

    pub fn next_store_id(&self) -> StoreId {
        StoreId(self.next_store_id)
    }

    pub fn next_partition_id(&self) -> PartitionId {
        PartitionId(self.next_partition_id)
    }

    pub fn id(&self) -> TabletId {
        self.id
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn config(&self) -> &Arc<TabletManagerConfig> {
        &self.config
    }

    pub fn is_sorted(&self) -> bool {
        self.schema.is_sorted()
    }

    pub fn generate_store_id(&mut self) -> StoreId {
        let id = StoreId(self.next_store_id);
        self.next_store_id += 1;
        id
    }

    /// Makes sure freshly generated ids stay above `id` (snapshot load).
    pub fn reserve_store_id(&mut self, id: StoreId) {
        self.next_store_id = self.next_store_id.max(id.0 + 1);
    }

    fn generate_partition_id(&mut self) -> PartitionId {
        let id = PartitionId(self.next_partition_id);
        self.next_partition_id += 1;
        id
    }

    pub fn stores(&self) -> impl Iterator<Item = &Store> {
        self.stores.values()
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    pub fn find_store(&self, id: StoreId) -> Option<&Store> {
        self.stores.get(&id)
    }

    pub fn active_store(&self) -> Option<&Store> {
        self.active_store.as_ref()
    }

    pub fn set_active_store(&mut self, store: Option<Store>) {
        self.active_store = store;
    }

    pub fn eden(&self) -> &Partition {
        &self.eden
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn find_partition(&self, id: PartitionId) -> Option<&Partition> {
        if id == EDEN_PARTITION_ID {
            return Some(&self.eden);
        }
        self.partitions.iter().find(|p| p.id == id)
    }

    fn find_partition_mut(&mut self, id: PartitionId) -> Option<&mut Partition> {
        if id == EDEN_PARTITION_ID {
            return Some(&mut self.eden);
        }
        self.partitions.iter_mut().find(|p| p.id == id)
    }

    /// Partition that fully contains `[min_key, max_key]`, if any.
    pub fn containing_partition(&self, min_key: &KeyBound, max_key: &KeyBound) -> Option<PartitionId> {
        self.partitions
            .iter()
            .find(|p| p.contains_range(min_key, max_key))
            .map(|p| p.id)
    }

    /// Registers a store. Dynamic stores always live in Eden; chunk stores go
    /// to `partition` when given.
    pub fn add_store(&mut self, store: Store, partition: Option<PartitionId>) -> TabletResult<()> {
        let target = if store.is_dynamic() || !self.is_sorted() {
            EDEN_PARTITION_ID
        } else {
            partition.unwrap_or(EDEN_PARTITION_ID)
        };
        let id = store.id();
        let part = self
            .find_partition_mut(target)
            .ok_or_else(|| TabletError::internal("NO_SUCH_PARTITION", format!("no partition {}", target)))?;
        part.store_ids.push(id);
        self.reserve_store_id(id);
        self.stores.insert(id, store);
        Ok(())
    }

    /// Detaches a store and marks it removed. Returns it if it was present.
    pub fn remove_store(&mut self, id: StoreId) -> Option<Store> {
        let store = self.stores.remove(&id)?;
        self.eden.store_ids.retain(|s| *s != id);
        for p in self.partitions.iter_mut() {
            p.store_ids.retain(|s| *s != id);
        }
        if self.active_store.as_ref().map(|s| s.id()) == Some(id) {
            self.active_store = None;
        }
        store.meta().set_state(StoreState::Removed);
        Some(store)
    }

    /// Partition currently holding store `id`.
    pub fn store_partition(&self, id: StoreId) -> Option<PartitionId> {
        if self.eden.store_ids.contains(&id) {
            return Some(EDEN_PARTITION_ID);
        }
        self.partitions
            .iter()
            .find(|p| p.store_ids.contains(&id))
            .map(|p| p.id)
    }

    /// Splits the partition at `index` at the given pivots. Each store of the
    /// old partition moves to the piece that contains it, or to Eden.
    pub fn split_partition(&mut self, index: usize, pivot_keys: Vec<RowKey>) -> TabletResult<Vec<PartitionId>> {
        let old = self.partitions.get(index).cloned().ok_or_else(|| {
            TabletError::internal("NO_SUCH_PARTITION", format!("no partition at index {}", index))
        })?;
        let mut bounds = vec![old.pivot_key.clone()];
        bounds.extend(pivot_keys.into_iter().map(KeyBound::Key));
        bounds.push(old.next_pivot_key.clone());
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TabletError::internal(
                "INVALID_PARTITION_PIVOTS",
                format!("pivot keys do not strictly split {}", old.id),
            ));
        }

        let mut pieces = Vec::with_capacity(bounds.len() - 1);
        for w in bounds.windows(2) {
            let id = self.generate_partition_id();
            pieces.push(Partition::new(id, w[0].clone(), w[1].clone()));
        }
        for store_id in old.store_ids {
            let Some(store) = self.stores.get(&store_id) else {
                continue;
            };
            let (min, max) = (store.min_key(), store.max_key());
            match pieces.iter_mut().find(|p| p.contains_range(&min, &max)) {
                Some(p) => p.store_ids.push(store_id),
                None => self.eden.store_ids.push(store_id),
            }
        }
        let ids = pieces.iter().map(|p| p.id).collect();
        self.partitions.splice(index..=index, pieces);
        tracing::info!(tablet_id = %self.id, partition = %old.id, "partition split");
        Ok(ids)
    }

    /// Merges partitions `first..=last` into one.
    pub fn merge_partitions(&mut self, first: usize, last: usize) -> TabletResult<PartitionId> {
        if first > last || last >= self.partitions.len() {
            return Err(TabletError::internal(
                "INVALID_PARTITION_RANGE",
                format!("cannot merge partitions {}..={} of {}", first, last, self.partitions.len()),
            ));
        }
        let id = self.generate_partition_id();
        let merged_parts: Vec<Partition> = self.partitions.drain(first..=last).collect();
        let mut merged = Partition::new(
            id,
            merged_parts[0].pivot_key.clone(),
            merged_parts[merged_parts.len() - 1].next_pivot_key.clone(),
        );
        for p in merged_parts {
            merged.store_ids.extend(p.store_ids);
        }
        self.partitions.insert(first, merged);
        tracing::info!(tablet_id = %self.id, partition = %id, "partitions merged");
        Ok(id)
    }

    pub fn update_partition_sample_keys(&mut self, id: PartitionId, sample_keys: Vec<RowKey>) -> TabletResult<()> {
        let part = self
            .find_partition_mut(id)
            .ok_or_else(|| TabletError::internal("NO_SUCH_PARTITION", format!("no partition {}", id)))?;
        part.sample_keys = sample_keys;
        Ok(())
    }

    /// Row index the next ordered store starts at.
    pub fn next_ordered_row_index(&self) -> u64 {
        self.stores
            .values()
            .map(|s| match s {
                Store::OrderedDynamic(o) => o.end_row_index(),
                Store::OrderedChunk(o) => o.end_row_index(),
                _ => 0,
            })
            .max()
            .unwrap_or(0)
    }

    /// Drops every store and the partitioning (bulk replacement).
    pub fn clear_stores(&mut self) -> Vec<Store> {
        let removed: Vec<Store> = std::mem::take(&mut self.stores).into_values().collect();
        for s in &removed {
            s.meta().set_state(StoreState::Removed);
        }
        self.active_store = None;
        self.eden.store_ids.clear();
        for p in self.partitions.iter_mut() {
            p.store_ids.clear();
        }
        removed
    }

    fn partition_snapshot(&self, p: &Partition) -> PartitionSnapshot {
        PartitionSnapshot {
            id: p.id,
            pivot_key: p.pivot_key.clone(),
            next_pivot_key: p.next_pivot_key.clone(),
            stores: p
                .store_ids
                .iter()
                .filter_map(|id| self.stores.get(id).cloned())
                .collect(),
            sample_keys: p.sample_keys.clone(),
        }
    }

    /// Publishes the current store layout to readers.
    pub fn publish_snapshot(&self) {
        let mut ordered_stores: Vec<Store> = self
            .stores
            .values()
            .filter(|s| !s.is_sorted())
            .cloned()
            .collect();
        ordered_stores.sort_by_key(|s| match s {
            Store::OrderedDynamic(o) => o.starting_row_index(),
            Store::OrderedChunk(o) => o.starting_row_index(),
            _ => 0,
        });
        self.snapshot.store(Arc::new(TabletSnapshot {
            tablet_id: self.id,
            schema: self.schema.clone(),
            config: self.config.clone(),
            eden: self.partition_snapshot(&self.eden),
            partitions: self
                .partitions
                .iter()
                .map(|p| self.partition_snapshot(p))
                .collect(),
            active_store: self.active_store.clone(),
            ordered_stores,
        }));
    }

    pub fn snapshot(&self) -> Arc<TabletSnapshot> {
        self.snapshot.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::SortedChunkStore;
    use tablet_common::types::Timestamp;
    use tablet_common::value::{Value, ValueType, VersionedRow, VersionedValue};

    fn tablet() -> Tablet {
        let schema = Arc::new(TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64]));
        Tablet::new(TabletId(1), schema, Arc::new(TabletManagerConfig::default()))
    }

    fn key(k: i64) -> RowKey {
        RowKey(vec![Value::Int64(k)])
    }

    fn chunk(id: u64, keys: &[i64]) -> Store {
        let rows = keys
            .iter()
            .map(|k| {
                VersionedRow::from_values(
                    vec![Value::Int64(*k)],
                    vec![VersionedValue::new(1, *k, Timestamp(5))],
                )
            })
            .collect();
        Store::SortedChunk(Arc::new(SortedChunkStore::new(
            StoreId(id),
            rows,
            Timestamp(5),
            Timestamp(5),
        )))
    }

    #[test]
    fn test_initial_layout() {
        let t = tablet();
        assert_eq!(t.partitions().len(), 1);
        assert_eq!(t.partitions()[0].pivot_key, KeyBound::Min);
        assert_eq!(t.partitions()[0].next_pivot_key, KeyBound::Max);
        assert!(t.eden().is_eden());
        assert_eq!(t.snapshot().partitions.len(), 1);
    }

    #[test]
    fn test_split_distributes_stores() {
        let mut t = tablet();
        let pid = t.partitions()[0].id;
        t.add_store(chunk(10, &[1, 2]), Some(pid)).unwrap();
        t.add_store(chunk(11, &[5, 15]), Some(pid)).unwrap();
        t.add_store(chunk(12, &[20, 30]), Some(pid)).unwrap();

        let ids = t.split_partition(0, vec![key(10)]).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(t.store_partition(StoreId(10)), Some(ids[0]));
        assert_eq!(t.store_partition(StoreId(11)), Some(EDEN_PARTITION_ID));
        assert_eq!(t.store_partition(StoreId(12)), Some(ids[1]));
        assert_eq!(t.partitions()[1].pivot_key, KeyBound::Key(key(10)));
        assert_eq!(t.next_store_id, 13);
    }

    #[test]
    fn test_split_rejects_bad_pivots() {
        let mut t = tablet();
        assert!(t.split_partition(0, vec![key(5), key(5)]).is_err());
        assert!(t.split_partition(3, vec![key(5)]).is_err());
    }

    #[test]
    fn test_merge_and_sample_keys() {
        let mut t = tablet();
        t.split_partition(0, vec![key(10), key(20)]).unwrap();
        assert_eq!(t.partitions().len(), 3);
        let merged = t.merge_partitions(1, 2).unwrap();
        assert_eq!(t.partitions().len(), 2);
        assert_eq!(t.partitions()[1].pivot_key, KeyBound::Key(key(10)));
        assert_eq!(t.partitions()[1].next_pivot_key, KeyBound::Max);

        t.update_partition_sample_keys(merged, vec![key(12), key(17)]).unwrap();
        assert_eq!(t.find_partition(merged).unwrap().sample_keys.len(), 2);
        assert!(t.merge_partitions(1, 0).is_err());
    }

    #[test]
    fn test_remove_store_marks_removed() {
        let mut t = tablet();
        let s = chunk(3, &[1]);
        t.add_store(s.clone(), None).unwrap();
        t.publish_snapshot();
        assert_eq!(t.snapshot().eden.stores.len(), 1);
        let removed = t.remove_store(StoreId(3)).unwrap();
        assert_eq!(removed.state(), StoreState::Removed);
        assert!(t.remove_store(StoreId(3)).is_none());
        t.publish_snapshot();
        assert!(t.snapshot().eden.stores.is_empty());
    }
}
