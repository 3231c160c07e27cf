//! Sorted dynamic store: the mutable in-memory generation of a sorted tablet.
//!
//! Rows are indexed by key in a lock-free skip list so readers can scan while
//! the apply thread inserts. Row contents follow the edit list discipline of
//! [`crate::dynamic_row`]: values become visible only when committed.
//!
//! Writes follow the row lock protocol:
//! 1. `write_row(key)` finds or inserts the row (only the index is touched).
//! 2. the caller checks and acquires the row's lock groups,
//! 3. `prepare_write` / `prepare_delete` stage uncommitted slots,
//! 4. `commit_row` publishes them at the commit timestamp, or `abort_row`
//!    drops them; both free the locks.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};

use tablet_common::config::EditListConfig;
use tablet_common::error::{LockConflictWinner, TabletError, TabletResult};
use tablet_common::schema::TableSchema;
use tablet_common::types::{StoreId, TabletId, Timestamp, TxnId};
use tablet_common::value::{ColumnId, UnversionedRow, Value, VersionedRow, VersionedValue};

use crate::comparer::{KeyBound, RowKey};
use crate::dynamic_row::{DynamicRow, DynamicRowData, LockMask, ValueSlot};
use crate::store::{StoreMeta, StoreState};

/// Approximate bytes of a freshly allocated row header.
const ROW_HEADER_BYTES: u64 = 64;
/// Rows fetched from the index per reader refill.
const READER_BATCH_SIZE: usize = 128;

/// Committed contents of one row as written to a tablet snapshot. Lists are
/// newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedDynamicRow {
    pub keys: Vec<Value>,
    pub values: Vec<VersionedValue>,
    /// Write timestamps per lock group.
    pub lock_write_timestamps: Vec<Vec<Timestamp>>,
    pub delete_timestamps: Vec<Timestamp>,
}

impl SavedDynamicRow {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.delete_timestamps.is_empty()
            && self.lock_write_timestamps.iter().all(|l| l.is_empty())
    }
}

/// Back-reference from a transaction to one row it locked.
#[derive(Clone)]
pub struct DynamicRowRef {
    pub store: Arc<SortedDynamicStore>,
    pub row: DynamicRow,
}

impl DynamicRowRef {
    pub fn new(store: Arc<SortedDynamicStore>, row: DynamicRow) -> Self {
        Self { store, row }
    }

    pub fn same_row(&self, other: &DynamicRowRef) -> bool {
        Arc::ptr_eq(&self.row, &other.row)
    }

    pub fn key(&self) -> &RowKey {
        self.row.key()
    }
}

impl std::fmt::Debug for DynamicRowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.row.key(), self.store.id())
    }
}

pub struct SortedDynamicStore {
    meta: StoreMeta,
    tablet_id: TabletId,
    schema: Arc<TableSchema>,
    edit_list_config: EditListConfig,
    rows: SkipMap<RowKey, DynamicRow>,
    row_count: AtomicU64,
    value_count: AtomicU64,
    timestamp_count: AtomicU64,
    /// Lock descriptors currently held by transactions.
    lock_count: AtomicI64,
    pool_size: AtomicU64,
    min_timestamp: AtomicU64,
    max_timestamp: AtomicU64,
    created_at: Instant,
}

impl SortedDynamicStore {
    pub fn new(
        id: StoreId,
        tablet_id: TabletId,
        schema: Arc<TableSchema>,
        edit_list_config: EditListConfig,
    ) -> Self {
        Self {
            meta: StoreMeta::new(id, StoreState::ActiveDynamic),
            tablet_id,
            schema,
            edit_list_config,
            rows: SkipMap::new(),
            row_count: AtomicU64::new(0),
            value_count: AtomicU64::new(0),
            timestamp_count: AtomicU64::new(0),
            lock_count: AtomicI64::new(0),
            pool_size: AtomicU64::new(0),
            min_timestamp: AtomicU64::new(Timestamp::MAX.0),
            max_timestamp: AtomicU64::new(Timestamp::MIN.0),
            created_at: Instant::now(),
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

    pub fn edit_list_config(&self) -> &EditListConfig {
        &self.edit_list_config
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Acquire)
    }

    pub fn value_count(&self) -> u64 {
        self.value_count.load(Ordering::Acquire)
    }

    /// Number of write and delete timestamps committed into rows of this store.
    pub fn timestamp_count(&self) -> u64 {
        self.timestamp_count.load(Ordering::Acquire)
    }

    pub fn lock_count(&self) -> i64 {
        self.lock_count.load(Ordering::Acquire)
    }

    /// Approximate memory held by rows and values.
    pub fn pool_size(&self) -> u64 {
        self.pool_size.load(Ordering::Acquire)
    }

    pub fn min_timestamp(&self) -> Timestamp {
        Timestamp(self.min_timestamp.load(Ordering::Acquire))
    }

    pub fn max_timestamp(&self) -> Timestamp {
        Timestamp(self.max_timestamp.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn note_timestamp(&self, ts: Timestamp) {
        self.timestamp_count.fetch_add(1, Ordering::AcqRel);
        self.min_timestamp.fetch_min(ts.0, Ordering::AcqRel);
        self.max_timestamp.fetch_max(ts.0, Ordering::AcqRel);
    }

    /// Finds or inserts the row for `key`. Existing rows are left untouched.
    pub fn write_row(&self, key: RowKey) -> DynamicRow {
        if let Some(entry) = self.rows.get(&key) {
            return entry.value().clone();
        }
        let row = DynamicRowData::allocate(
            key.clone(),
            self.schema.lock_count(),
            self.schema.value_column_count(),
        );
        let key_bytes: u64 = key.values().iter().map(|v| v.byte_size() as u64).sum();
        self.rows.insert(key, row.clone());
        self.row_count.fetch_add(1, Ordering::AcqRel);
        self.pool_size
            .fetch_add(ROW_HEADER_BYTES + key_bytes, Ordering::AcqRel);
        row
    }

    pub fn find_row(&self, key: &RowKey) -> Option<DynamicRow> {
        self.rows.get(key).map(|e| e.value().clone())
    }

    pub fn get_all_rows(&self) -> Vec<DynamicRow> {
        self.rows.iter().map(|e| e.value().clone()).collect()
    }

    /// Lock groups a write of `row` has to hold.
    pub fn write_lock_mask(&self, row: &UnversionedRow) -> LockMask {
        let mask = row
            .values
            .iter()
            .filter(|v| !self.schema.is_key_column(v.id))
            .fold(LockMask::default(), |m, v| {
                m.with(self.schema.column_lock_index(v.id))
            });
        if mask.is_empty() {
            LockMask::primary()
        } else {
            mask
        }
    }

    pub fn delete_lock_mask(&self) -> LockMask {
        LockMask::all(self.schema.lock_count())
    }

    /// Fails fast when `txn` may not take `mask` on `row`.
    pub fn check_row_locks(
        &self,
        row: &DynamicRowData,
        txn: TxnId,
        start_ts: Timestamp,
        mask: LockMask,
    ) -> TabletResult<()> {
        row.check_locks(txn, start_ts, mask)
            .map_err(|(lock_index, winner)| {
                tracing::debug!(
                    tablet_id = %self.tablet_id,
                    store_id = %self.id(),
                    txn_id = %txn,
                    key = %row.key(),
                    lock_index,
                    winner = %winner,
                    "row lock conflict"
                );
                TabletError::LockConflict {
                    txn_id: txn,
                    key: row.key().to_string(),
                    lock_index,
                    winner,
                }
            })
    }

    pub fn acquire_row_locks(&self, row: &DynamicRowData, txn: TxnId, mask: LockMask) {
        let acquired = row.acquire_locks(txn, mask);
        self.lock_count.fetch_add(acquired as i64, Ordering::AcqRel);
    }

    /// Frees the locks `txn` holds on `row` without touching its values.
    pub fn release_row_locks(&self, row: &DynamicRowData, txn: TxnId) {
        let released = row.release_locks(txn);
        self.lock_count.fetch_sub(released as i64, Ordering::AcqRel);
    }

    /// Stages the non-key values of `values` as uncommitted slots.
    /// The caller must hold the matching locks.
    pub fn prepare_write(&self, row: &DynamicRowData, values: &UnversionedRow) -> TabletResult<()> {
        row.abort_delete();
        let key_count = self.schema.key_column_count;
        for v in &values.values {
            let id = v.id as usize;
            if id < key_count {
                continue;
            }
            if id >= self.schema.column_count() {
                return Err(TabletError::internal(
                    "COLUMN_OUT_OF_SCHEMA",
                    format!("column id {} is out of schema", id),
                ));
            }
            row.prepare_value(
                id - key_count,
                ValueSlot {
                    value: v.value.clone(),
                    timestamp: Timestamp::UNCOMMITTED,
                    aggregate: v.aggregate,
                },
                &self.edit_list_config,
            )?;
            self.value_count.fetch_add(1, Ordering::AcqRel);
            self.pool_size
                .fetch_add(v.value.byte_size() as u64 + 16, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Stages a delete. The caller must hold every lock of the row.
    pub fn prepare_delete(&self, row: &DynamicRowData) -> TabletResult<()> {
        row.abort_values(&self.schema, self.delete_lock_mask());
        row.prepare_delete(&self.edit_list_config)
    }

    pub fn prepare_row(&self, row: &DynamicRowData, txn: TxnId, prepare_ts: Timestamp) {
        row.prepare_locks(txn, prepare_ts);
    }

    pub fn commit_row(&self, row: &DynamicRowData, txn: TxnId, commit_ts: Timestamp) -> TabletResult<()> {
        let released = row.commit(&self.schema, txn, commit_ts, &self.edit_list_config)?;
        self.lock_count.fetch_sub(released as i64, Ordering::AcqRel);
        self.note_timestamp(commit_ts);
        Ok(())
    }

    pub fn abort_row(&self, row: &DynamicRowData, txn: TxnId) {
        let released = row.abort(&self.schema, txn);
        self.lock_count.fetch_sub(released as i64, Ordering::AcqRel);
    }

    /// Fails when `versioned` cannot be applied: the row is locked or has a
    /// commit at or after the oldest incoming timestamp.
    pub fn check_versioned_row(&self, versioned: &VersionedRow) -> TabletResult<()> {
        let key = RowKey(versioned.keys.clone());
        let Some(row) = self.find_row(&key) else {
            return Ok(());
        };
        if let Some(owner) = row.locks().iter().find_map(|l| l.transaction()) {
            return Err(TabletError::LockConflict {
                txn_id: TxnId::NONE,
                key: key.to_string(),
                lock_index: 0,
                winner: LockConflictWinner::Transaction(owner),
            });
        }
        check_timestamp_order(&key, row.latest_commit_timestamp(), versioned)
    }

    /// Applies a row carrying explicit timestamps (replication). Every
    /// timestamp must be newer than anything already committed on the row.
    pub fn write_versioned_row(&self, versioned: &VersionedRow) -> TabletResult<DynamicRow> {
        self.check_versioned_row(versioned)?;
        let row = self.write_row(RowKey(versioned.keys.clone()));

        let key_count = self.schema.key_column_count;
        // canonical rows hold newest first; edit lists append oldest first
        for v in versioned.values.iter().rev() {
            let id = v.id as usize;
            if id < key_count || id >= self.schema.column_count() {
                continue;
            }
            row.push_committed_value(
                id - key_count,
                ValueSlot {
                    value: v.value.clone(),
                    timestamp: v.timestamp,
                    aggregate: v.aggregate,
                },
                &self.edit_list_config,
            )?;
            self.value_count.fetch_add(1, Ordering::AcqRel);
            self.pool_size
                .fetch_add(v.value.byte_size() as u64 + 16, Ordering::AcqRel);
        }
        for ts in versioned.write_timestamps.iter().rev() {
            row.push_write_timestamp(0, *ts, &self.edit_list_config)?;
            self.note_timestamp(*ts);
        }
        for ts in versioned.delete_timestamps.iter().rev() {
            row.push_delete_timestamp(*ts, &self.edit_list_config)?;
            self.note_timestamp(*ts);
        }
        Ok(row)
    }

    pub fn lookup_row(
        &self,
        key: &RowKey,
        timestamp: Timestamp,
        column_filter: Option<&[ColumnId]>,
    ) -> Option<VersionedRow> {
        self.rows
            .get(key)
            .and_then(|e| e.value().versioned_row(&self.schema, timestamp, column_filter))
    }

    /// Reader over rows with keys in `[lower, upper)`, history cut at `timestamp`.
    pub fn create_reader(
        self: &Arc<Self>,
        lower: KeyBound,
        upper: KeyBound,
        timestamp: Timestamp,
        column_filter: Option<Vec<ColumnId>>,
    ) -> SortedDynamicStoreReader {
        let next = match lower {
            KeyBound::Min => Some(Bound::Unbounded),
            KeyBound::Key(k) => Some(Bound::Included(k)),
            KeyBound::Max => None,
        };
        SortedDynamicStoreReader {
            store: self.clone(),
            next,
            upper,
            timestamp,
            column_filter,
            buffer: VecDeque::new(),
        }
    }

    /// Every committed version; used by flush once the store is passive and unlocked.
    pub fn committed_rows(&self) -> Vec<VersionedRow> {
        self.rows
            .iter()
            .filter_map(|e| {
                e.value()
                    .versioned_row(&self.schema, Timestamp::ALL_COMMITTED, None)
            })
            .collect()
    }

    /// Committed state of every row, per lock group.
    pub fn saved_rows(&self) -> Vec<SavedDynamicRow> {
        let key_count = self.schema.key_column_count;
        self.rows
            .iter()
            .map(|e| {
                let row = e.value();
                let mut values = Vec::new();
                for i in 0..row.value_column_count() {
                    values.extend(row.value_versions(i).into_iter().map(|slot| VersionedValue {
                        id: (key_count + i) as ColumnId,
                        value: slot.value,
                        timestamp: slot.timestamp,
                        aggregate: slot.aggregate,
                    }));
                }
                SavedDynamicRow {
                    keys: row.key().values().to_vec(),
                    values,
                    lock_write_timestamps: (0..row.lock_count())
                        .map(|i| row.lock_write_timestamps(i))
                        .collect(),
                    delete_timestamps: row.delete_timestamps(),
                }
            })
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// Re-inserts a saved row into an empty store.
    pub fn restore_row(&self, saved: &SavedDynamicRow) -> TabletResult<()> {
        let row = self.write_row(RowKey(saved.keys.clone()));
        if saved.lock_write_timestamps.len() > row.lock_count() {
            return Err(TabletError::SnapshotCorrupted(format!(
                "row {} has {} lock groups, schema has {}",
                row.key(),
                saved.lock_write_timestamps.len(),
                row.lock_count()
            )));
        }
        let key_count = self.schema.key_column_count;
        for v in saved.values.iter().rev() {
            let id = v.id as usize;
            if id < key_count || id >= self.schema.column_count() {
                return Err(TabletError::SnapshotCorrupted(format!(
                    "row {} has column id {} out of schema",
                    row.key(),
                    id
                )));
            }
            row.push_committed_value(
                id - key_count,
                ValueSlot {
                    value: v.value.clone(),
                    timestamp: v.timestamp,
                    aggregate: v.aggregate,
                },
                &self.edit_list_config,
            )?;
            self.value_count.fetch_add(1, Ordering::AcqRel);
            self.pool_size
                .fetch_add(v.value.byte_size() as u64 + 16, Ordering::AcqRel);
        }
        for (lock_index, timestamps) in saved.lock_write_timestamps.iter().enumerate() {
            for ts in timestamps.iter().rev() {
                row.push_write_timestamp(lock_index, *ts, &self.edit_list_config)?;
                self.note_timestamp(*ts);
            }
        }
        for ts in saved.delete_timestamps.iter().rev() {
            row.push_delete_timestamp(*ts, &self.edit_list_config)?;
            self.note_timestamp(*ts);
        }
        Ok(())
    }

    /// Rows holding any uncommitted slot or lock.
    pub fn locked_rows(&self) -> Vec<DynamicRow> {
        self.rows
            .iter()
            .filter(|e| e.value().is_locked() || e.value().has_uncommitted())
            .map(|e| e.value().clone())
            .collect()
    }
}

/// Batched reader over a sorted dynamic store. Each refill re-seeks the
/// index after the last returned key, so concurrent inserts are tolerated.
pub struct SortedDynamicStoreReader {
    store: Arc<SortedDynamicStore>,
    next: Option<Bound<RowKey>>,
    upper: KeyBound,
    timestamp: Timestamp,
    column_filter: Option<Vec<ColumnId>>,
    buffer: VecDeque<VersionedRow>,
}

impl SortedDynamicStoreReader {
    fn refill(&mut self) {
        while self.buffer.is_empty() {
            let lower = match self.next.take() {
                Some(b) => b,
                None => return,
            };
            let upper = match &self.upper {
                KeyBound::Min => return,
                KeyBound::Key(k) => Bound::Excluded(k.clone()),
                KeyBound::Max => Bound::Unbounded,
            };
            let mut last_key = None;
            let mut fetched = 0;
            for entry in self.store.rows.range((lower, upper)) {
                fetched += 1;
                last_key = Some(entry.key().clone());
                if let Some(row) = entry.value().versioned_row(
                    &self.store.schema,
                    self.timestamp,
                    self.column_filter.as_deref(),
                ) {
                    self.buffer.push_back(row);
                }
                if fetched >= READER_BATCH_SIZE {
                    break;
                }
            }
            match last_key {
                Some(k) if fetched >= READER_BATCH_SIZE => self.next = Some(Bound::Excluded(k)),
                _ => return,
            }
        }
    }
}

impl Iterator for SortedDynamicStoreReader {
    type Item = VersionedRow;

    fn next(&mut self) -> Option<VersionedRow> {
        if self.buffer.is_empty() {
            self.refill();
        }
        self.buffer.pop_front()
    }
}

/// Rejects `versioned` unless all of its timestamps are newer than `latest`.
pub fn check_timestamp_order(key: &RowKey, latest: Timestamp, versioned: &VersionedRow) -> TabletResult<()> {
    match versioned.timestamp_range() {
        Some((oldest, _)) if latest > Timestamp::MIN && latest >= oldest => Err(TabletError::TimestampOutOfOrder {
            key: key.to_string(),
            timestamp: oldest,
            latest,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::value::{UnversionedValue, Value, ValueType, VersionedValue};

    fn store() -> Arc<SortedDynamicStore> {
        let schema = Arc::new(TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64]));
        Arc::new(SortedDynamicStore::new(
            StoreId(1),
            TabletId(1),
            schema,
            EditListConfig::default(),
        ))
    }

    fn key(k: i64) -> RowKey {
        RowKey(vec![Value::Int64(k)])
    }

    fn row(k: i64, v: i64) -> UnversionedRow {
        UnversionedRow::new(vec![UnversionedValue::new(0, k), UnversionedValue::new(1, v)])
    }

    fn write_and_commit(s: &SortedDynamicStore, txn: u64, k: i64, v: i64, ts: u64) {
        let r = s.write_row(key(k));
        let mask = s.write_lock_mask(&row(k, v));
        s.check_row_locks(&r, TxnId(txn), Timestamp(ts - 1), mask).unwrap();
        s.acquire_row_locks(&r, TxnId(txn), mask);
        s.prepare_write(&r, &row(k, v)).unwrap();
        s.commit_row(&r, TxnId(txn), Timestamp(ts)).unwrap();
    }

    #[test]
    fn test_write_row_finds_existing() {
        let s = store();
        let a = s.write_row(key(1));
        let b = s.write_row(key(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(s.row_count(), 1);
        assert!(s.find_row(&key(2)).is_none());
    }

    #[test]
    fn test_visibility_by_timestamp() {
        let s = store();
        write_and_commit(&s, 1, 1, 10, 0x20);
        write_and_commit(&s, 2, 1, 20, 0x40);

        assert!(s.lookup_row(&key(1), Timestamp(0x10), None).is_none());
        let at_30 = s.lookup_row(&key(1), Timestamp(0x30), None).unwrap();
        assert_eq!(at_30.values[0].value, Value::Int64(10));
        let latest = s.lookup_row(&key(1), Timestamp::ALL_COMMITTED, None).unwrap();
        assert_eq!(latest.values[0].value, Value::Int64(20));
        assert_eq!(s.timestamp_count(), 2);
        assert_eq!(s.min_timestamp(), Timestamp(0x20));
        assert_eq!(s.max_timestamp(), Timestamp(0x40));
    }

    #[test]
    fn test_lock_accounting() {
        let s = store();
        let r = s.write_row(key(1));
        s.acquire_row_locks(&r, TxnId(1), LockMask::primary());
        assert_eq!(s.lock_count(), 1);
        let err = s
            .check_row_locks(&r, TxnId(2), Timestamp(5), LockMask::primary())
            .unwrap_err();
        assert!(err.to_string().contains("lock conflict due to concurrent write"));
        s.abort_row(&r, TxnId(1));
        assert_eq!(s.lock_count(), 0);
        assert!(s.locked_rows().is_empty());
    }

    #[test]
    fn test_uncommitted_is_invisible() {
        let s = store();
        let r = s.write_row(key(1));
        s.acquire_row_locks(&r, TxnId(1), LockMask::primary());
        s.prepare_write(&r, &row(1, 5)).unwrap();
        assert!(s.lookup_row(&key(1), Timestamp::ALL_COMMITTED, None).is_none());
        assert_eq!(s.locked_rows().len(), 1);
    }

    #[test]
    fn test_delete_hides_older_write() {
        let s = store();
        write_and_commit(&s, 1, 1, 10, 0x20);
        let r = s.write_row(key(1));
        s.acquire_row_locks(&r, TxnId(2), s.delete_lock_mask());
        s.prepare_delete(&r).unwrap();
        s.commit_row(&r, TxnId(2), Timestamp(0x30)).unwrap();
        let hist = s.lookup_row(&key(1), Timestamp::ALL_COMMITTED, None).unwrap();
        assert_eq!(hist.delete_timestamps, vec![Timestamp(0x30)]);
        assert_eq!(hist.write_timestamps, vec![Timestamp(0x20)]);
    }

    #[test]
    fn test_reader_range_and_batches() {
        let s = store();
        for k in 0..300 {
            write_and_commit(&s, k as u64 + 1, k, k * 10, 0x100 + k as u64);
        }
        let keys: Vec<i64> = s
            .create_reader(
                KeyBound::key(vec![Value::Int64(10)]),
                KeyBound::key(vec![Value::Int64(290)]),
                Timestamp::ALL_COMMITTED,
                None,
            )
            .map(|r| r.keys[0].as_i64().unwrap())
            .collect();
        assert_eq!(keys.len(), 280);
        assert_eq!(keys.first(), Some(&10));
        assert_eq!(keys.last(), Some(&289));

        let all = s
            .create_reader(KeyBound::Min, KeyBound::Max, Timestamp::ALL_COMMITTED, None)
            .count();
        assert_eq!(all, 300);
        let none = s
            .create_reader(KeyBound::Max, KeyBound::Max, Timestamp::ALL_COMMITTED, None)
            .count();
        assert_eq!(none, 0);
    }

    #[test]
    fn test_versioned_write_requires_newer_timestamps() {
        let s = store();
        let v = VersionedRow::from_values(
            vec![Value::Int64(1)],
            vec![VersionedValue::new(1, 1i64, Timestamp(0x25))],
        );
        s.write_versioned_row(&v).unwrap();
        let got = s.lookup_row(&key(1), Timestamp::ALL_COMMITTED, None).unwrap();
        assert_eq!(got, v);

        let older = VersionedRow::from_values(
            vec![Value::Int64(1)],
            vec![VersionedValue::new(1, 5i64, Timestamp(0x20))],
        );
        assert!(matches!(
            s.write_versioned_row(&older),
            Err(TabletError::TimestampOutOfOrder { .. })
        ));
    }

    #[test]
    fn test_rejected_versioned_write_adds_no_row() {
        let s = store();
        let r = s.write_row(key(1));
        s.acquire_row_locks(&r, TxnId(1), s.write_lock_mask(&row(1, 1)));
        write_and_commit(&s, 2, 2, 7, 0x30);
        let (rows, pool, values) = (s.row_count(), s.pool_size(), s.value_count());

        let locked = VersionedRow::from_values(
            vec![Value::Int64(1)],
            vec![VersionedValue::new(1, 1i64, Timestamp(0x25))],
        );
        assert!(s.write_versioned_row(&locked).unwrap_err().is_lock_conflict());

        let older = VersionedRow::from_values(
            vec![Value::Int64(2)],
            vec![VersionedValue::new(1, 5i64, Timestamp(0x20))],
        );
        assert!(s.check_versioned_row(&older).is_err());
        assert!(s.write_versioned_row(&older).is_err());
        assert_eq!((s.row_count(), s.pool_size(), s.value_count()), (rows, pool, values));
    }
}
