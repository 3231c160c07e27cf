//! In-memory row format of sorted dynamic stores.
//!
//! ```text
//!  DynamicRow
//!  ├── key (immutable) + null key mask
//!  ├── delete lock flag
//!  ├── locks[lock_count]        owner txn, prepare ts, last commit ts,
//!  │                            write timestamp edit list
//!  ├── delete timestamps        edit list
//!  └── columns[value columns]   edit list per column
//!
//!  EditList (newest) ──successor──▶ EditList (older) ──▶ ...
//!  [slot0 slot1 .. slot(size-1) | uncommitted?]
//! ```
//!
//! Only the tablet's apply thread mutates rows. Readers run concurrently and
//! rely on two rules: a slot is written before `size` is bumped with release
//! ordering, and a list head is swapped in only after its successor link is
//! set. Published slots are never touched again.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tablet_common::config::EditListConfig;
use tablet_common::error::{LockConflictWinner, TabletError, TabletResult};
use tablet_common::schema::{TableSchema, MAX_LOCK_COUNT};
use tablet_common::types::{Timestamp, TxnId};
use tablet_common::value::{ColumnId, Value, VersionedRow, VersionedValue};

use crate::comparer::RowKey;

/// Append-only list of timestamped entries.
pub struct EditList<T> {
    slots: Box<[OnceLock<T>]>,
    size: AtomicUsize,
    uncommitted: Mutex<Option<T>>,
    successor: OnceLock<Arc<EditList<T>>>,
    successors_size: AtomicUsize,
}

impl<T: Clone> EditList<T> {
    pub fn allocate(capacity: usize) -> Arc<Self> {
        let slots = (0..capacity.max(1)).map(|_| OnceLock::new()).collect();
        Arc::new(Self {
            slots,
            size: AtomicUsize::new(0),
            uncommitted: Mutex::new(None),
            successor: OnceLock::new(),
            successors_size: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of committed slots in this list.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn uncommitted_size(&self) -> usize {
        usize::from(self.uncommitted.lock().is_some())
    }

    pub fn has_uncommitted(&self) -> bool {
        self.uncommitted.lock().is_some()
    }

    pub fn is_full(&self) -> bool {
        self.size() == self.capacity()
    }

    /// Committed entries in this list and every older list.
    pub fn full_size(&self) -> usize {
        self.size() + self.successors_size.load(Ordering::Acquire)
    }

    pub fn successor(&self) -> Option<&Arc<EditList<T>>> {
        self.successor.get()
    }

    /// Links `older` behind this list. Neither list may hold an uncommitted slot.
    pub fn set_successor(&self, older: Arc<EditList<T>>) -> TabletResult<()> {
        if self.has_uncommitted() || older.has_uncommitted() {
            return Err(TabletError::internal(
                "EDIT_LIST_SUCCESSOR_UNCOMMITTED",
                "cannot chain edit lists with an outstanding uncommitted slot",
            ));
        }
        let older_size = older.full_size();
        self.successor.set(older).map_err(|_| {
            TabletError::internal("EDIT_LIST_SUCCESSOR_SET", "edit list successor is already set")
        })?;
        self.successors_size.store(older_size, Ordering::Release);
        Ok(())
    }

    /// Reserves the next slot as uncommitted and fills it with `value`.
    pub fn prepare(&self, value: T) -> TabletResult<()> {
        let mut uncommitted = self.uncommitted.lock();
        if uncommitted.is_some() {
            return Err(TabletError::internal(
                "EDIT_LIST_DOUBLE_PREPARE",
                "edit list already has an uncommitted slot",
            ));
        }
        if self.is_full() {
            return Err(TabletError::internal(
                "EDIT_LIST_FULL",
                "edit list is full; chain a new list first",
            ));
        }
        *uncommitted = Some(value);
        Ok(())
    }

    /// Overwrites the uncommitted slot (a repeated write by the lock owner).
    pub fn replace_uncommitted(&self, value: T) -> TabletResult<()> {
        let mut uncommitted = self.uncommitted.lock();
        match uncommitted.as_mut() {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TabletError::internal(
                "EDIT_LIST_NOTHING_PREPARED",
                "no uncommitted slot to replace",
            )),
        }
    }

    /// Publishes the uncommitted slot after `finish` stamps it.
    pub fn commit_with(&self, finish: impl FnOnce(&mut T)) -> TabletResult<()> {
        let mut value = self.uncommitted.lock().take().ok_or_else(|| {
            TabletError::internal("EDIT_LIST_NOTHING_PREPARED", "no uncommitted slot to commit")
        })?;
        finish(&mut value);
        let index = self.size.load(Ordering::Relaxed);
        if self.slots[index].set(value).is_err() {
            return Err(TabletError::internal(
                "EDIT_LIST_SLOT_REUSED",
                format!("edit list slot {} was already published", index),
            ));
        }
        self.size.store(index + 1, Ordering::Release);
        Ok(())
    }

    pub fn commit(&self) -> TabletResult<()> {
        self.commit_with(|_| {})
    }

    /// Drops the uncommitted slot; returns whether there was one.
    pub fn abort(&self) -> bool {
        self.uncommitted.lock().take().is_some()
    }

    /// Prepare and commit in one step.
    pub fn push(&self, value: T) -> TabletResult<()> {
        self.prepare(value)?;
        self.commit()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.size() {
            self.slots[index].get()
        } else {
            None
        }
    }

    /// Newest committed entry across the chain.
    pub fn latest(&self) -> Option<&T> {
        let size = self.size();
        if size > 0 {
            return self.slots[size - 1].get();
        }
        self.successor.get().and_then(|s| s.latest())
    }

    /// Committed entries from newest to oldest across the whole chain.
    pub fn iter_newest_first(&self) -> EditListIter<'_, T> {
        EditListIter {
            current: Some(self),
            remaining: self.size(),
        }
    }
}

pub struct EditListIter<'a, T> {
    current: Option<&'a EditList<T>>,
    remaining: usize,
}

impl<'a, T: Clone> Iterator for EditListIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            let list = self.current?;
            if self.remaining > 0 {
                self.remaining -= 1;
                return list.slots[self.remaining].get();
            }
            self.current = list.successor.get().map(|s| s.as_ref());
            self.remaining = self.current.map(|l| l.size()).unwrap_or(0);
        }
    }
}

/// Returns a list with room for one more slot, chaining a fresh list in
/// front of a full one.
pub(crate) fn writable_list<T: Clone>(
    head: &ArcSwapOption<EditList<T>>,
    config: &EditListConfig,
) -> TabletResult<Arc<EditList<T>>> {
    match head.load_full() {
        Some(list) if !list.is_full() => Ok(list),
        Some(list) => {
            let next = EditList::allocate(config.next_capacity(Some(list.capacity())));
            next.set_successor(list)?;
            head.store(Some(next.clone()));
            Ok(next)
        }
        None => {
            let list = EditList::allocate(config.next_capacity(None));
            head.store(Some(list.clone()));
            Ok(list)
        }
    }
}

/// A committed or pending value in a column edit list.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSlot {
    pub value: Value,
    pub timestamp: Timestamp,
    pub aggregate: bool,
}

/// Set of lock groups a write touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LockMask(pub u32);

impl LockMask {
    pub const MAX_LOCKS: usize = MAX_LOCK_COUNT;

    pub fn all(lock_count: usize) -> Self {
        if lock_count >= Self::MAX_LOCKS {
            LockMask(u32::MAX)
        } else {
            LockMask((1u32 << lock_count) - 1)
        }
    }

    pub fn primary() -> Self {
        LockMask(1)
    }

    pub fn with(self, index: usize) -> Self {
        LockMask(self.0 | (1u32 << index))
    }

    pub fn contains(self, index: usize) -> bool {
        index < Self::MAX_LOCKS && self.0 & (1u32 << index) != 0
    }

    pub fn union(self, other: LockMask) -> Self {
        LockMask(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn indexes(self) -> impl Iterator<Item = usize> {
        (0..Self::MAX_LOCKS).filter(move |i| self.contains(*i))
    }
}

/// Lock state of one lock group on one row.
pub struct LockDescriptor {
    transaction: AtomicU64,
    prepare_timestamp: AtomicU64,
    last_commit_timestamp: AtomicU64,
    write_timestamps: ArcSwapOption<EditList<Timestamp>>,
}

impl LockDescriptor {
    fn new() -> Self {
        Self {
            transaction: AtomicU64::new(TxnId::NONE.0),
            prepare_timestamp: AtomicU64::new(Timestamp::NOT_PREPARED.0),
            last_commit_timestamp: AtomicU64::new(Timestamp::MIN.0),
            write_timestamps: ArcSwapOption::empty(),
        }
    }

    pub fn transaction(&self) -> Option<TxnId> {
        let txn = TxnId(self.transaction.load(Ordering::Acquire));
        if txn.is_none() {
            None
        } else {
            Some(txn)
        }
    }

    pub fn prepare_timestamp(&self) -> Timestamp {
        Timestamp(self.prepare_timestamp.load(Ordering::Acquire))
    }

    pub fn last_commit_timestamp(&self) -> Timestamp {
        Timestamp(self.last_commit_timestamp.load(Ordering::Acquire))
    }

    pub(crate) fn set_last_commit_timestamp(&self, ts: Timestamp) {
        self.last_commit_timestamp.store(ts.0, Ordering::Release);
    }

    pub fn write_timestamps(&self) -> Option<Arc<EditList<Timestamp>>> {
        self.write_timestamps.load_full()
    }
}

pub type DynamicRow = Arc<DynamicRowData>;

/// One logical key of a sorted dynamic store.
pub struct DynamicRowData {
    key: RowKey,
    null_key_mask: u64,
    delete_lock: AtomicBool,
    locks: Box<[LockDescriptor]>,
    delete_timestamps: ArcSwapOption<EditList<Timestamp>>,
    columns: Box<[ArcSwapOption<EditList<ValueSlot>>]>,
}

impl std::fmt::Debug for DynamicRowData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicRowData")
            .field("key", &self.key)
            .field("null_key_mask", &self.null_key_mask)
            .finish_non_exhaustive()
    }
}

impl DynamicRowData {
    /// Every lock starts free, unprepared, and committed at `Timestamp::MIN`;
    /// every edit list head starts empty.
    pub fn allocate(key: RowKey, lock_count: usize, value_column_count: usize) -> DynamicRow {
        let null_key_mask = key.null_mask();
        Arc::new(Self {
            key,
            null_key_mask,
            delete_lock: AtomicBool::new(false),
            locks: (0..lock_count.max(1)).map(|_| LockDescriptor::new()).collect(),
            delete_timestamps: ArcSwapOption::empty(),
            columns: (0..value_column_count)
                .map(|_| ArcSwapOption::empty())
                .collect(),
        })
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn null_key_mask(&self) -> u64 {
        self.null_key_mask
    }

    pub fn is_delete_locked(&self) -> bool {
        self.delete_lock.load(Ordering::Acquire)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn lock(&self, index: usize) -> &LockDescriptor {
        &self.locks[index]
    }

    pub fn locks(&self) -> &[LockDescriptor] {
        &self.locks
    }

    pub fn value_column_count(&self) -> usize {
        self.columns.len()
    }

    /// Fails fast if any lock in `mask` is owned by another transaction or
    /// was committed after `start_ts`.
    pub fn check_locks(
        &self,
        txn: TxnId,
        start_ts: Timestamp,
        mask: LockMask,
    ) -> Result<(), (usize, LockConflictWinner)> {
        for index in mask.indexes().take_while(|i| *i < self.locks.len()) {
            let lock = &self.locks[index];
            match lock.transaction() {
                Some(owner) if owner == txn => continue,
                Some(owner) => return Err((index, LockConflictWinner::Transaction(owner))),
                None => {}
            }
            let last_commit = lock.last_commit_timestamp();
            if last_commit > start_ts {
                return Err((index, LockConflictWinner::CommittedAt(last_commit)));
            }
        }
        Ok(())
    }

    /// Takes every free lock in `mask`; returns how many were newly taken.
    pub(crate) fn acquire_locks(&self, txn: TxnId, mask: LockMask) -> usize {
        let mut acquired = 0;
        for index in mask.indexes().take_while(|i| *i < self.locks.len()) {
            let lock = &self.locks[index];
            if lock.transaction().is_none() {
                lock.transaction.store(txn.0, Ordering::Release);
                lock.prepare_timestamp
                    .store(Timestamp::NOT_PREPARED.0, Ordering::Release);
                acquired += 1;
            }
        }
        acquired
    }

    /// Frees every lock owned by `txn`; returns how many were freed.
    pub(crate) fn release_locks(&self, txn: TxnId) -> usize {
        let mut released = 0;
        for lock in self.locks.iter() {
            if lock.transaction() == Some(txn) {
                lock.transaction.store(TxnId::NONE.0, Ordering::Release);
                lock.prepare_timestamp
                    .store(Timestamp::NOT_PREPARED.0, Ordering::Release);
                released += 1;
            }
        }
        if released > 0 {
            self.delete_lock.store(false, Ordering::Release);
        }
        released
    }

    pub(crate) fn prepare_locks(&self, txn: TxnId, prepare_ts: Timestamp) {
        for lock in self.locks.iter() {
            if lock.transaction() == Some(txn) {
                lock.prepare_timestamp.store(prepare_ts.0, Ordering::Release);
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locks.iter().any(|l| l.transaction().is_some())
    }

    pub fn is_locked_by(&self, txn: TxnId) -> bool {
        self.locks.iter().any(|l| l.transaction() == Some(txn))
    }

    fn owned_mask(&self, txn: TxnId) -> LockMask {
        self.locks
            .iter()
            .enumerate()
            .filter(|(_, l)| l.transaction() == Some(txn))
            .fold(LockMask::default(), |m, (i, _)| m.with(i))
    }

    pub(crate) fn prepare_value(
        &self,
        value_index: usize,
        slot: ValueSlot,
        config: &EditListConfig,
    ) -> TabletResult<()> {
        let head = &self.columns[value_index];
        if let Some(list) = head.load_full() {
            if list.has_uncommitted() {
                return list.replace_uncommitted(slot);
            }
        }
        writable_list(head, config)?.prepare(slot)
    }

    pub(crate) fn prepare_delete(&self, config: &EditListConfig) -> TabletResult<()> {
        self.delete_lock.store(true, Ordering::Release);
        if let Some(list) = self.delete_timestamps.load_full() {
            if list.has_uncommitted() {
                return Ok(());
            }
        }
        writable_list(&self.delete_timestamps, config)?.prepare(Timestamp::UNCOMMITTED)
    }

    pub(crate) fn abort_delete(&self) -> bool {
        self.delete_timestamps
            .load_full()
            .map(|l| l.abort())
            .unwrap_or(false)
    }

    pub fn has_uncommitted_delete(&self) -> bool {
        self.delete_timestamps
            .load_full()
            .map(|l| l.has_uncommitted())
            .unwrap_or(false)
    }

    /// Aborts uncommitted value slots of columns guarded by locks in `mask`.
    pub(crate) fn abort_values(&self, schema: &TableSchema, mask: LockMask) -> usize {
        let mut aborted = 0;
        for (i, head) in self.columns.iter().enumerate() {
            let id = (schema.key_column_count + i) as ColumnId;
            if !mask.contains(schema.column_lock_index(id)) {
                continue;
            }
            if let Some(list) = head.load_full() {
                if list.abort() {
                    aborted += 1;
                }
            }
        }
        aborted
    }

    /// Drops everything `txn` prepared on this row and frees its locks.
    pub(crate) fn abort(&self, schema: &TableSchema, txn: TxnId) -> usize {
        let mask = self.owned_mask(txn);
        self.abort_values(schema, mask);
        if mask.0 == LockMask::all(self.locks.len()).0 {
            self.abort_delete();
        }
        self.release_locks(txn)
    }

    /// Publishes everything `txn` prepared on this row at `commit_ts` and
    /// frees its locks. Returns the number of locks freed.
    pub(crate) fn commit(
        &self,
        schema: &TableSchema,
        txn: TxnId,
        commit_ts: Timestamp,
        config: &EditListConfig,
    ) -> TabletResult<usize> {
        let mask = self.owned_mask(txn);
        let deleting = self.is_delete_locked()
            && mask.0 == LockMask::all(self.locks.len()).0
            && self.has_uncommitted_delete();

        for (i, head) in self.columns.iter().enumerate() {
            let id = (schema.key_column_count + i) as ColumnId;
            if !mask.contains(schema.column_lock_index(id)) {
                continue;
            }
            if let Some(list) = head.load_full() {
                if list.has_uncommitted() {
                    list.commit_with(|slot| slot.timestamp = commit_ts)?;
                }
            }
        }

        if deleting {
            if let Some(list) = self.delete_timestamps.load_full() {
                list.commit_with(|ts| *ts = commit_ts)?;
            }
        }

        for index in mask.indexes().take_while(|i| *i < self.locks.len()) {
            let lock = &self.locks[index];
            if !deleting {
                writable_list(&lock.write_timestamps, config)?.push(commit_ts)?;
            }
            lock.set_last_commit_timestamp(commit_ts);
        }
        Ok(self.release_locks(txn))
    }

    /// Appends an already committed value (replication and snapshot load).
    pub(crate) fn push_committed_value(
        &self,
        value_index: usize,
        slot: ValueSlot,
        config: &EditListConfig,
    ) -> TabletResult<()> {
        writable_list(&self.columns[value_index], config)?.push(slot)
    }

    pub(crate) fn push_write_timestamp(
        &self,
        lock_index: usize,
        ts: Timestamp,
        config: &EditListConfig,
    ) -> TabletResult<()> {
        let lock = &self.locks[lock_index];
        writable_list(&lock.write_timestamps, config)?.push(ts)?;
        if ts > lock.last_commit_timestamp() {
            lock.set_last_commit_timestamp(ts);
        }
        Ok(())
    }

    pub(crate) fn push_delete_timestamp(
        &self,
        ts: Timestamp,
        config: &EditListConfig,
    ) -> TabletResult<()> {
        writable_list(&self.delete_timestamps, config)?.push(ts)?;
        for lock in self.locks.iter() {
            if ts > lock.last_commit_timestamp() {
                lock.set_last_commit_timestamp(ts);
            }
        }
        Ok(())
    }

    /// Committed versions of one value column, newest first.
    pub fn value_versions(&self, value_index: usize) -> Vec<ValueSlot> {
        match self.columns[value_index].load_full() {
            Some(list) => list.iter_newest_first().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn latest_value_timestamp(&self, value_index: usize) -> Option<Timestamp> {
        self.columns[value_index]
            .load_full()
            .and_then(|l| l.latest().map(|s| s.timestamp))
    }

    /// Committed write timestamps over all locks, newest first, deduplicated.
    pub fn write_timestamps(&self) -> Vec<Timestamp> {
        let mut out: Vec<Timestamp> = Vec::new();
        for lock in self.locks.iter() {
            if let Some(list) = lock.write_timestamps.load_full() {
                out.extend(list.iter_newest_first().copied());
            }
        }
        out.sort_by(|a, b| b.cmp(a));
        out.dedup();
        out
    }

    /// Committed write timestamps of one lock, newest first.
    pub fn lock_write_timestamps(&self, lock_index: usize) -> Vec<Timestamp> {
        self.locks[lock_index]
            .write_timestamps
            .load_full()
            .map(|l| l.iter_newest_first().copied().collect())
            .unwrap_or_default()
    }

    pub fn delete_timestamps(&self) -> Vec<Timestamp> {
        self.delete_timestamps
            .load_full()
            .map(|l| l.iter_newest_first().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_uncommitted(&self) -> bool {
        self.has_uncommitted_delete()
            || self.columns.iter().any(|head| {
                head.load_full()
                    .map(|l| l.has_uncommitted())
                    .unwrap_or(false)
            })
    }

    /// Latest committed write or delete timestamp of the row.
    pub fn latest_commit_timestamp(&self) -> Timestamp {
        self.locks
            .iter()
            .map(|l| l.last_commit_timestamp())
            .max()
            .unwrap_or(Timestamp::MIN)
    }

    /// Committed history visible at `timestamp`, restricted to `column_filter`
    /// (value column ids) when given.
    pub fn versioned_row(
        &self,
        schema: &TableSchema,
        timestamp: Timestamp,
        column_filter: Option<&[ColumnId]>,
    ) -> Option<VersionedRow> {
        let key_count = schema.key_column_count;
        let mut values = Vec::new();
        for i in 0..self.columns.len() {
            let id = (key_count + i) as ColumnId;
            if let Some(filter) = column_filter {
                if !filter.contains(&id) {
                    continue;
                }
            }
            for slot in self.value_versions(i) {
                if slot.timestamp <= timestamp {
                    values.push(VersionedValue {
                        id,
                        value: slot.value,
                        timestamp: slot.timestamp,
                        aggregate: slot.aggregate,
                    });
                }
            }
        }
        let write_timestamps: Vec<Timestamp> = self
            .write_timestamps()
            .into_iter()
            .filter(|ts| *ts <= timestamp)
            .collect();
        let delete_timestamps: Vec<Timestamp> = self
            .delete_timestamps()
            .into_iter()
            .filter(|ts| *ts <= timestamp)
            .collect();
        if write_timestamps.is_empty() && delete_timestamps.is_empty() {
            return None;
        }
        let mut row = VersionedRow {
            keys: self.key.values().to_vec(),
            values,
            write_timestamps,
            delete_timestamps,
        };
        row.normalize();
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::value::ValueType;

    fn slot(v: i64) -> ValueSlot {
        ValueSlot {
            value: Value::Int64(v),
            timestamp: Timestamp::UNCOMMITTED,
            aggregate: false,
        }
    }

    #[test]
    fn test_edit_list_prepare_commit_abort() {
        let list: Arc<EditList<Timestamp>> = EditList::allocate(2);
        assert_eq!(list.size(), 0);
        list.prepare(Timestamp::UNCOMMITTED).unwrap();
        assert_eq!(list.uncommitted_size(), 1);
        // invisible until committed
        assert!(list.latest().is_none());
        list.commit_with(|ts| *ts = Timestamp(10)).unwrap();
        assert_eq!(list.size(), 1);
        assert_eq!(list.uncommitted_size(), 0);
        assert_eq!(list.latest(), Some(&Timestamp(10)));

        list.prepare(Timestamp::UNCOMMITTED).unwrap();
        assert!(list.abort());
        assert_eq!(list.size(), 1);
        assert!(!list.abort());
    }

    #[test]
    fn test_edit_list_preconditions() {
        let list: Arc<EditList<Timestamp>> = EditList::allocate(1);
        list.prepare(Timestamp(1)).unwrap();
        assert!(list.prepare(Timestamp(2)).is_err());
        list.commit().unwrap();
        assert!(list.is_full());
        assert!(list.prepare(Timestamp(3)).is_err());
        assert!(list.commit().is_err());
    }

    #[test]
    fn test_edit_list_chaining() {
        let older: Arc<EditList<Timestamp>> = EditList::allocate(2);
        older.push(Timestamp(1)).unwrap();
        older.push(Timestamp(2)).unwrap();
        let newer: Arc<EditList<Timestamp>> = EditList::allocate(4);
        newer.set_successor(older.clone()).unwrap();
        newer.push(Timestamp(3)).unwrap();
        assert_eq!(newer.full_size(), 3);
        let all: Vec<Timestamp> = newer.iter_newest_first().copied().collect();
        assert_eq!(all, vec![Timestamp(3), Timestamp(2), Timestamp(1)]);
        assert!(newer.set_successor(older).is_err());
    }

    #[test]
    fn test_successor_requires_no_uncommitted() {
        let older: Arc<EditList<Timestamp>> = EditList::allocate(2);
        older.prepare(Timestamp(1)).unwrap();
        let newer: Arc<EditList<Timestamp>> = EditList::allocate(2);
        assert!(newer.set_successor(older).is_err());
    }

    #[test]
    fn test_writable_list_grows_by_chaining() {
        let cfg = EditListConfig::default();
        let head: ArcSwapOption<EditList<Timestamp>> = ArcSwapOption::empty();
        for i in 1..=7u64 {
            writable_list(&head, &cfg).unwrap().push(Timestamp(i)).unwrap();
        }
        let list = head.load_full().unwrap();
        // 2 + 4 filled, third list of capacity 8 holds the seventh entry
        assert_eq!(list.capacity(), 8);
        assert_eq!(list.size(), 1);
        assert_eq!(list.full_size(), 7);
        let all: Vec<u64> = list.iter_newest_first().map(|t| t.0).collect();
        assert_eq!(all, vec![7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_row_allocation_defaults() {
        let row = DynamicRowData::allocate(RowKey(vec![Value::Null, Value::Int64(1)]), 2, 3);
        assert_eq!(row.null_key_mask(), 0b01);
        assert_eq!(row.lock_count(), 2);
        for lock in row.locks() {
            assert!(lock.transaction().is_none());
            assert_eq!(lock.prepare_timestamp(), Timestamp::NOT_PREPARED);
            assert_eq!(lock.last_commit_timestamp(), Timestamp::MIN);
        }
        assert!(!row.is_delete_locked());
        assert!(row.write_timestamps().is_empty());
    }

    #[test]
    fn test_row_lock_conflict_and_commit() {
        let schema = TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64]);
        let cfg = EditListConfig::default();
        let row = DynamicRowData::allocate(RowKey(vec![Value::Int64(1)]), 1, 1);

        row.check_locks(TxnId(1), Timestamp(0x10), LockMask::primary()).unwrap();
        assert_eq!(row.acquire_locks(TxnId(1), LockMask::primary()), 1);
        row.prepare_value(0, slot(42), &cfg).unwrap();

        let err = row
            .check_locks(TxnId(2), Timestamp(0x11), LockMask::primary())
            .unwrap_err();
        assert_eq!(err, (0, LockConflictWinner::Transaction(TxnId(1))));

        row.prepare_locks(TxnId(1), Timestamp(0x15));
        assert_eq!(row.lock(0).prepare_timestamp(), Timestamp(0x15));
        assert_eq!(row.commit(&schema, TxnId(1), Timestamp(0x20), &cfg).unwrap(), 1);
        assert!(!row.is_locked());
        assert_eq!(row.write_timestamps(), vec![Timestamp(0x20)]);
        assert_eq!(row.value_versions(0)[0].value, Value::Int64(42));

        // a writer that started before the commit loses
        let err = row
            .check_locks(TxnId(2), Timestamp(0x11), LockMask::primary())
            .unwrap_err();
        assert_eq!(err, (0, LockConflictWinner::CommittedAt(Timestamp(0x20))));
        row.check_locks(TxnId(3), Timestamp(0x21), LockMask::primary()).unwrap();
    }

    #[test]
    fn test_row_abort_leaves_no_uncommitted() {
        let schema = TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64]);
        let cfg = EditListConfig::default();
        let row = DynamicRowData::allocate(RowKey(vec![Value::Int64(1)]), 1, 1);
        row.acquire_locks(TxnId(1), LockMask::primary());
        row.prepare_value(0, slot(1), &cfg).unwrap();
        row.prepare_value(0, slot(2), &cfg).unwrap();
        assert!(row.has_uncommitted());
        assert_eq!(row.abort(&schema, TxnId(1)), 1);
        assert!(!row.has_uncommitted());
        assert!(!row.is_locked());
        assert!(row.value_versions(0).is_empty());
    }

    #[test]
    fn test_row_delete_commit() {
        let schema = TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64]);
        let cfg = EditListConfig::default();
        let row = DynamicRowData::allocate(RowKey(vec![Value::Int64(1)]), 1, 1);
        row.acquire_locks(TxnId(1), LockMask::all(1));
        row.prepare_delete(&cfg).unwrap();
        row.commit(&schema, TxnId(1), Timestamp(0x30), &cfg).unwrap();
        assert_eq!(row.delete_timestamps(), vec![Timestamp(0x30)]);
        assert!(row.write_timestamps().is_empty());
        assert!(!row.is_delete_locked());
    }

    #[test]
    fn test_versioned_row_respects_timestamp() {
        let schema = TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64]);
        let cfg = EditListConfig::default();
        let row = DynamicRowData::allocate(RowKey(vec![Value::Int64(1)]), 1, 1);
        for (txn, ts, v) in [(1u64, 0x20u64, 1i64), (2, 0x40, 2)] {
            row.acquire_locks(TxnId(txn), LockMask::primary());
            row.prepare_value(0, slot(v), &cfg).unwrap();
            row.commit(&schema, TxnId(txn), Timestamp(ts), &cfg).unwrap();
        }
        assert!(row.versioned_row(&schema, Timestamp(0x1f), None).is_none());
        let at_30 = row.versioned_row(&schema, Timestamp(0x30), None).unwrap();
        assert_eq!(at_30.values.len(), 1);
        assert_eq!(at_30.values[0].value, Value::Int64(1));
        let all = row.versioned_row(&schema, Timestamp::ALL_COMMITTED, None).unwrap();
        assert_eq!(all.write_timestamps, vec![Timestamp(0x40), Timestamp(0x20)]);
    }
}
