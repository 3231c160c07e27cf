//! Ordered dynamic store: append-only rows addressed by row index.
//!
//! Ordered (queue-like) tablets have no key. Each committed row gets the next
//! row index; a store covers `[starting_row_index, starting_row_index + row_count)`.
//!
//! Storage is a fixed table of segments whose capacities double
//! (`initial, 2*initial, 4*initial, ...`). A segment is allocated once and
//! never moved, so readers index into it without locks. The writer fills the
//! slot first and then publishes the new row count with release ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use tablet_common::error::{TabletError, TabletResult};
use tablet_common::schema::TableSchema;
use tablet_common::types::{StoreId, TabletId, Timestamp};
use tablet_common::value::UnversionedRow;

use crate::store::{StoreMeta, StoreState};

const INITIAL_SEGMENT_CAPACITY: u64 = 64;
const MAX_SEGMENTS: usize = 32;

/// One committed row of an ordered tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedRow {
    pub row_index: u64,
    /// Commit timestamp of the row (the `$timestamp` system column).
    pub timestamp: Timestamp,
    pub row: UnversionedRow,
}

type Segment = Box<[OnceLock<OrderedRow>]>;

fn locate(offset: u64) -> (usize, usize) {
    let q = offset / INITIAL_SEGMENT_CAPACITY + 1;
    let segment = (63 - q.leading_zeros()) as usize;
    let segment_start = INITIAL_SEGMENT_CAPACITY * ((1u64 << segment) - 1);
    (segment, (offset - segment_start) as usize)
}

pub struct OrderedDynamicStore {
    meta: StoreMeta,
    tablet_id: TabletId,
    schema: Arc<TableSchema>,
    starting_row_index: u64,
    segments: Box<[OnceLock<Segment>]>,
    row_count: AtomicU64,
    pool_size: AtomicU64,
    min_timestamp: AtomicU64,
    max_timestamp: AtomicU64,
}

impl OrderedDynamicStore {
    pub fn new(
        id: StoreId,
        tablet_id: TabletId,
        schema: Arc<TableSchema>,
        starting_row_index: u64,
    ) -> Self {
        Self {
            meta: StoreMeta::new(id, StoreState::ActiveDynamic),
            tablet_id,
            schema,
            starting_row_index,
            segments: (0..MAX_SEGMENTS).map(|_| OnceLock::new()).collect(),
            row_count: AtomicU64::new(0),
            pool_size: AtomicU64::new(0),
            min_timestamp: AtomicU64::new(Timestamp::MAX.0),
            max_timestamp: AtomicU64::new(Timestamp::MIN.0),
        }
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn id(&self) -> StoreId {
        self.meta.id()
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    pub fn starting_row_index(&self) -> u64 {
        self.starting_row_index
    }

    /// First row index past this store.
    pub fn end_row_index(&self) -> u64 {
        self.starting_row_index + self.row_count()
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Acquire)
    }

    /// One timestamp per row.
    pub fn timestamp_count(&self) -> u64 {
        self.row_count()
    }

    pub fn pool_size(&self) -> u64 {
        self.pool_size.load(Ordering::Acquire)
    }

    pub fn min_timestamp(&self) -> Timestamp {
        Timestamp(self.min_timestamp.load(Ordering::Acquire))
    }

    pub fn max_timestamp(&self) -> Timestamp {
        Timestamp(self.max_timestamp.load(Ordering::Acquire))
    }

    /// Appends a committed row; returns its row index. Single writer only.
    pub fn write_row(&self, row: UnversionedRow, commit_ts: Timestamp) -> TabletResult<u64> {
        let offset = self.row_count.load(Ordering::Relaxed);
        let (segment, slot) = locate(offset);
        if segment >= MAX_SEGMENTS {
            return Err(TabletError::internal(
                "ORDERED_STORE_FULL",
                format!("ordered store {} cannot hold more rows", self.id()),
            ));
        }
        let segment_rows = self.segments[segment].get_or_init(|| {
            let capacity = (INITIAL_SEGMENT_CAPACITY << segment) as usize;
            (0..capacity).map(|_| OnceLock::new()).collect()
        });
        let row_index = self.starting_row_index + offset;
        let bytes: u64 = row.values.iter().map(|v| v.value.byte_size() as u64 + 8).sum();
        segment_rows[slot]
            .set(OrderedRow {
                row_index,
                timestamp: commit_ts,
                row,
            })
            .map_err(|_| {
                TabletError::internal(
                    "ORDERED_STORE_SLOT_REUSED",
                    format!("row index {} was already written", row_index),
                )
            })?;
        self.row_count.store(offset + 1, Ordering::Release);
        self.pool_size.fetch_add(bytes + 16, Ordering::AcqRel);
        self.min_timestamp.fetch_min(commit_ts.0, Ordering::AcqRel);
        self.max_timestamp.fetch_max(commit_ts.0, Ordering::AcqRel);
        Ok(row_index)
    }

    pub fn get_row(&self, row_index: u64) -> Option<OrderedRow> {
        if row_index < self.starting_row_index || row_index >= self.end_row_index() {
            return None;
        }
        let (segment, slot) = locate(row_index - self.starting_row_index);
        self.segments[segment].get()?.get(slot)?.get().cloned()
    }

    pub fn get_all_rows(&self) -> Vec<OrderedRow> {
        self.read_rows(self.starting_row_index, self.end_row_index())
    }

    /// Rows with indexes in `[lower, upper)`, clamped to what is published.
    pub fn read_rows(&self, lower: u64, upper: u64) -> Vec<OrderedRow> {
        let lower = lower.max(self.starting_row_index);
        let upper = upper.min(self.end_row_index());
        (lower..upper).filter_map(|i| self.get_row(i)).collect()
    }

    /// Rebuilds a passive store from saved rows. Rows must be contiguous
    /// starting at `starting_row_index`.
    pub fn load(
        id: StoreId,
        tablet_id: TabletId,
        schema: Arc<TableSchema>,
        starting_row_index: u64,
        rows: Vec<OrderedRow>,
    ) -> TabletResult<Self> {
        let store = Self::new(id, tablet_id, schema, starting_row_index);
        for (i, row) in rows.into_iter().enumerate() {
            let expected = starting_row_index + i as u64;
            if row.row_index != expected {
                return Err(TabletError::SnapshotCorrupted(format!(
                    "ordered store {} row index {} does not follow {}",
                    id,
                    row.row_index,
                    expected.saturating_sub(1)
                )));
            }
            store.write_row(row.row, row.timestamp)?;
        }
        Ok(store)
    }
}
