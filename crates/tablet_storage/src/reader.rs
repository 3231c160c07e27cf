//! Tablet readers: merge the stores of a tablet snapshot into one ordered
//! row stream.
//!
//! Store selection:
//! - range `[lower, upper)`: every store of Eden and of the partitions the
//!   range touches with `min_key < upper && max_key >= lower`;
//! - single key: Eden plus the partition containing the key, stores with
//!   `min_key <= key <= max_key`.
//!
//! A read touching more stores than `max_read_fan_in` fails instead of
//! reading a subset. Sub-readers are opened lazily, in `min_key` order, only
//! once the merge reaches their first key.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};

use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::Timestamp;
use tablet_common::value::{ColumnId, UnversionedRow, VersionedRow};

use crate::comparer::{KeyBound, RowKey};
use crate::ordered_dynamic_store::OrderedRow;
use crate::row_merger::{RowMerger, SchemafulRowMerger, VersionedRowMerger};
use crate::store::{Store, VersionedRowIter};
use crate::tablet::{PartitionSnapshot, TabletSnapshot};

fn check_fan_in(snapshot: &TabletSnapshot, fan_in: usize) -> TabletResult<()> {
    let fan_in_limit = snapshot.config.max_read_fan_in;
    if fan_in > fan_in_limit {
        tracing::debug!(tablet_id = %snapshot.tablet_id, fan_in, fan_in_limit, "read fan-in exceeded");
        metrics::counter!("tablet_read_fan_in_exceeded_total").increment(1);
        return Err(TabletError::FanInExceeded {
            tablet_id: snapshot.tablet_id,
            fan_in,
            fan_in_limit,
        });
    }
    Ok(())
}

fn store_intersects_range(store: &Store, lower: &KeyBound, upper: &KeyBound) -> bool {
    store.min_key() < *upper && store.max_key() >= *lower
}

fn store_contains_key(store: &Store, key: &RowKey) -> bool {
    store.min_key().cmp_key(key) != Ordering::Greater && store.max_key().cmp_key(key) != Ordering::Less
}

/// Stores a range read over `[lower, upper)` has to merge.
pub fn build_store_range(snapshot: &TabletSnapshot, lower: &KeyBound, upper: &KeyBound) -> TabletResult<Vec<Store>> {
    let mut stores: Vec<Store> = snapshot
        .eden
        .stores
        .iter()
        .filter(|s| store_intersects_range(s, lower, upper))
        .cloned()
        .collect();
    for partition in snapshot
        .partitions
        .iter()
        .filter(|p| p.pivot_key < *upper && p.next_pivot_key > *lower)
    {
        stores.extend(
            partition
                .stores
                .iter()
                .filter(|s| store_intersects_range(s, lower, upper))
                .cloned(),
        );
    }
    check_fan_in(snapshot, stores.len())?;
    Ok(stores)
}

/// Index of the partition containing `key`.
fn partition_index(partitions: &[PartitionSnapshot], key: &RowKey) -> Option<usize> {
    let after = partitions.partition_point(|p| p.pivot_key.cmp_key(key) != Ordering::Greater);
    after.checked_sub(1)
}

/// Stores a lookup of `key` has to consult.
pub fn take_partition(snapshot: &TabletSnapshot, key: &RowKey) -> TabletResult<Vec<Store>> {
    let mut stores: Vec<Store> = snapshot
        .eden
        .stores
        .iter()
        .filter(|s| store_contains_key(s, key))
        .cloned()
        .collect();
    if let Some(index) = partition_index(&snapshot.partitions, key) {
        stores.extend(
            snapshot.partitions[index]
                .stores
                .iter()
                .filter(|s| store_contains_key(s, key))
                .cloned(),
        );
    }
    check_fan_in(snapshot, stores.len())?;
    Ok(stores)
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    key: RowKey,
    reader: usize,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).then(self.reader.cmp(&other.reader))
    }
}

/// Heap merge of per-store versioned readers.
pub struct MergingReader<M: RowMerger> {
    stores: Vec<Store>,
    next_store: usize,
    lower: KeyBound,
    upper: KeyBound,
    timestamp: Timestamp,
    column_filter: Option<Vec<ColumnId>>,
    readers: Vec<VersionedRowIter>,
    heads: Vec<Option<VersionedRow>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    merger: M,
}

pub type SchemafulTabletReader = MergingReader<SchemafulRowMerger>;
pub type VersionedTabletReader = MergingReader<VersionedRowMerger>;

impl<M: RowMerger> MergingReader<M> {
    fn new(
        mut stores: Vec<Store>,
        lower: KeyBound,
        upper: KeyBound,
        timestamp: Timestamp,
        column_filter: Option<Vec<ColumnId>>,
        merger: M,
    ) -> Self {
        stores.sort_by_key(|s| s.min_key());
        Self {
            stores,
            next_store: 0,
            lower,
            upper,
            timestamp,
            column_filter,
            readers: Vec::new(),
            heads: Vec::new(),
            heap: BinaryHeap::new(),
            merger,
        }
    }

    /// Number of stores the reader merges.
    pub fn fan_in(&self) -> usize {
        self.stores.len()
    }

    fn advance(&mut self, reader: usize) {
        if let Some(row) = self.readers[reader].next() {
            self.heap.push(Reverse(HeapEntry {
                key: RowKey(row.keys.clone()),
                reader,
            }));
            self.heads[reader] = Some(row);
        }
    }

    fn open_next_store(&mut self) {
        let store = &self.stores[self.next_store];
        self.next_store += 1;
        let reader = store.create_versioned_reader(
            &self.lower,
            &self.upper,
            self.timestamp,
            self.column_filter.as_deref(),
        );
        self.readers.push(reader);
        self.heads.push(None);
        self.advance(self.readers.len() - 1);
    }

    fn open_due_stores(&mut self) {
        while self.next_store < self.stores.len() {
            let due = match self.heap.peek() {
                None => true,
                Some(Reverse(top)) => self.stores[self.next_store].min_key().cmp_key(&top.key) != Ordering::Greater,
            };
            if !due {
                break;
            }
            self.open_next_store();
        }
    }
}

impl<M: RowMerger> Iterator for MergingReader<M> {
    type Item = M::Output;

    fn next(&mut self) -> Option<M::Output> {
        loop {
            self.open_due_stores();
            let Reverse(top) = self.heap.pop()?;
            let mut rows = Vec::new();
            rows.extend(self.heads[top.reader].take());
            self.advance(top.reader);
            while let Some(Reverse(entry)) = self.heap.peek() {
                if entry.key != top.key {
                    break;
                }
                let reader = entry.reader;
                self.heap.pop();
                rows.extend(self.heads[reader].take());
                self.advance(reader);
            }
            if let Some(out) = self.merger.merge(rows) {
                return Some(out);
            }
        }
    }
}

/// Rows of `[lower, upper)` as of `timestamp`.
pub fn create_schemaful_tablet_reader(
    snapshot: &TabletSnapshot,
    lower: KeyBound,
    upper: KeyBound,
    timestamp: Timestamp,
    column_filter: Option<&[ColumnId]>,
) -> TabletResult<SchemafulTabletReader> {
    let stores = build_store_range(snapshot, &lower, &upper)?;
    let merger = SchemafulRowMerger::new(snapshot.schema.clone(), timestamp, column_filter);
    Ok(MergingReader::new(
        stores,
        lower,
        upper,
        timestamp,
        column_filter.map(|f| f.to_vec()),
        merger,
    ))
}

/// Full histories of `[lower, upper)` up to `current_timestamp`; versions
/// made obsolete by `major_timestamp` are dropped (`NULL` keeps everything).
pub fn create_versioned_tablet_reader(
    snapshot: &TabletSnapshot,
    lower: KeyBound,
    upper: KeyBound,
    current_timestamp: Timestamp,
    major_timestamp: Timestamp,
    column_filter: Option<&[ColumnId]>,
) -> TabletResult<VersionedTabletReader> {
    let stores = build_store_range(snapshot, &lower, &upper)?;
    let filter = column_filter.map(|f| f.to_vec());
    let merger = VersionedRowMerger::new(
        snapshot.schema.clone(),
        current_timestamp,
        major_timestamp,
        filter.clone(),
    );
    Ok(MergingReader::new(stores, lower, upper, current_timestamp, filter, merger))
}

fn lookup_with<M: RowMerger>(
    snapshot: &TabletSnapshot,
    key: &RowKey,
    timestamp: Timestamp,
    column_filter: Option<&[ColumnId]>,
    merger: &mut M,
) -> TabletResult<Option<M::Output>> {
    let rows: Vec<VersionedRow> = take_partition(snapshot, key)?
        .iter()
        .filter_map(|s| s.lookup_row(key, timestamp, column_filter))
        .collect();
    if rows.is_empty() {
        return Ok(None);
    }
    Ok(merger.merge(rows))
}

/// Point lookups; one result per key, in key order of the request.
pub fn lookup_rows(
    snapshot: &TabletSnapshot,
    keys: &[RowKey],
    timestamp: Timestamp,
    column_filter: Option<&[ColumnId]>,
) -> TabletResult<Vec<Option<UnversionedRow>>> {
    let mut merger = SchemafulRowMerger::new(snapshot.schema.clone(), timestamp, column_filter);
    keys.iter()
        .map(|key| lookup_with(snapshot, key, timestamp, column_filter, &mut merger))
        .collect()
}

/// Full history of one key up to `timestamp`.
pub fn versioned_lookup_row(
    snapshot: &TabletSnapshot,
    key: &RowKey,
    timestamp: Timestamp,
    column_filter: Option<&[ColumnId]>,
) -> TabletResult<Option<VersionedRow>> {
    let mut merger = VersionedRowMerger::new(
        snapshot.schema.clone(),
        timestamp,
        Timestamp::NULL,
        column_filter.map(|f| f.to_vec()),
    );
    lookup_with(snapshot, key, timestamp, column_filter, &mut merger)
}

/// Lookup results of one partition: `(position in the request, row)`.
pub type KeySetBatch = Vec<(usize, Option<UnversionedRow>)>;

/// Looks keys up per partition, running up to `max_parallel_partition_lookups`
/// partitions at once. Batches come out in completion order.
pub fn create_schemaful_key_set_reader(
    snapshot: Arc<TabletSnapshot>,
    keys: Vec<RowKey>,
    timestamp: Timestamp,
    column_filter: Option<Vec<ColumnId>>,
) -> BoxStream<'static, TabletResult<KeySetBatch>> {
    let mut groups: Vec<Vec<(usize, RowKey)>> = vec![Vec::new(); snapshot.partitions.len().max(1)];
    for (position, key) in keys.into_iter().enumerate() {
        let index = partition_index(&snapshot.partitions, &key).unwrap_or(0);
        groups[index].push((position, key));
    }
    let concurrency = snapshot.config.max_parallel_partition_lookups.max(1);
    let tasks = groups
        .into_iter()
        .filter(|g| !g.is_empty())
        .map(move |group| {
            let snapshot = snapshot.clone();
            let column_filter = column_filter.clone();
            async move {
                tokio::task::spawn_blocking(move || -> TabletResult<KeySetBatch> {
                    let mut merger =
                        SchemafulRowMerger::new(snapshot.schema.clone(), timestamp, column_filter.as_deref());
                    group
                        .into_iter()
                        .map(|(position, key)| {
                            lookup_with(&snapshot, &key, timestamp, column_filter.as_deref(), &mut merger)
                                .map(|row| (position, row))
                        })
                        .collect()
                })
                .await
                .map_err(|e| TabletError::internal("KEY_SET_LOOKUP_PANICKED", e.to_string()))?
            }
        });
    stream::iter(tasks).buffer_unordered(concurrency).boxed()
}

/// Runs a key-set read to completion; results follow the order of `keys`.
pub async fn lookup_rows_concurrently(
    snapshot: Arc<TabletSnapshot>,
    keys: Vec<RowKey>,
    timestamp: Timestamp,
    column_filter: Option<Vec<ColumnId>>,
) -> TabletResult<Vec<Option<UnversionedRow>>> {
    let mut result = vec![None; keys.len()];
    let mut batches = create_schemaful_key_set_reader(snapshot, keys, timestamp, column_filter);
    while let Some(batch) = batches.next().await {
        for (position, row) in batch? {
            result[position] = row;
        }
    }
    Ok(result)
}

/// Rows of an ordered tablet with indexes in `[lower, upper)`.
pub fn read_ordered_rows(snapshot: &TabletSnapshot, lower: u64, upper: u64) -> TabletResult<Vec<OrderedRow>> {
    let stores: Vec<&Store> = snapshot
        .ordered_stores
        .iter()
        .filter(|s| match s {
            Store::OrderedDynamic(o) => o.starting_row_index() < upper && o.end_row_index() > lower,
            Store::OrderedChunk(o) => o.starting_row_index() < upper && o.end_row_index() > lower,
            _ => false,
        })
        .collect();
    check_fan_in(snapshot, stores.len())?;
    let mut rows = Vec::new();
    for store in stores {
        match store {
            Store::OrderedDynamic(o) => rows.extend(o.read_rows(lower, upper)),
            Store::OrderedChunk(o) => rows.extend(o.read_rows(lower, upper)),
            _ => {}
        }
    }
    Ok(rows)
}
