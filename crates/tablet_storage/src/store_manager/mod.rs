//! Store managers: rotation, flush, compaction and write execution for one tablet.
//!
//! ```text
//!  StoreManager (trait, shared lifecycle in StoreManagerBase)
//!  ├── SortedStoreManager       row locks, versioned writes, partitions
//!  ├── OrderedStoreManager      append at commit time
//!  └── ReplicatedStoreManager   wraps OrderedStoreManager, writes log rows
//! ```
//!
//! Store lifecycle:
//! ```text
//!  Active ──rotate──▶ Passive ──begin_store_flush──▶ Flushing ──end_store_flush──▶ (chunk store)
//!                        ▲                               │
//!                        └──────backoff_store_flush──────┘
//! ```
//!
//! All mutating methods run on the tablet's apply thread. Background work
//! (the flush and compaction callbacks) runs elsewhere and reports back
//! through the `end_*`/`backoff_*` methods.

mod ordered;
mod replicated;
mod sorted;

pub use ordered::OrderedStoreManager;
pub use replicated::{build_log_row, log_schema, ChangeType, LogValueFlags, ReplicatedStoreManager};
pub use sorted::SortedStoreManager;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tablet_common::bg_supervisor::{ActivityKind, BgActivitySupervisor};
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{PartitionId, StoreId, Timestamp, TxnId};
use tablet_common::value::{UnversionedRow, Value, VersionedRow};

use crate::chunk_store::{ChunkRows, FlushedChunk, OrderedChunkStore, SortedChunkStore};
use crate::comparer::RowKey;
use crate::dynamic_row::LockMask;
use crate::row_merger::{RowMerger, VersionedRowMerger};
use crate::sorted_dynamic_store::DynamicRowRef;
use crate::store::{Store, StoreActivityState, StoreState};
use crate::tablet::Tablet;

/// Produces the immutable form of a passive store. Runs off the apply thread.
pub type StoreFlushCallback = Box<dyn FnOnce() -> TabletResult<FlushedChunk> + Send>;

/// Merges a set of chunk stores into one chunk. Runs off the apply thread.
pub type StoreCompactionCallback = Box<dyn FnOnce() -> TabletResult<FlushedChunk> + Send>;

/// One row command of a write batch.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum WireCommand {
    WriteRow(UnversionedRow),
    /// Takes the given lock groups without writing them, plus the groups the
    /// row's values need.
    ReadLockWriteRow { locks: LockMask, row: UnversionedRow },
    /// Deletes the row with these key values.
    DeleteRow(Vec<Value>),
    /// Replicated row carrying its own timestamps.
    WriteVersionedRow(VersionedRow),
}

impl WireCommand {
    pub fn is_versioned(&self) -> bool {
        matches!(self, WireCommand::WriteVersionedRow(_))
    }

    /// Key of the row the command touches (sorted tables).
    pub fn key(&self, key_column_count: usize) -> RowKey {
        match self {
            WireCommand::WriteRow(row) | WireCommand::ReadLockWriteRow { row, .. } => {
                RowKey(row.key(key_column_count))
            }
            WireCommand::DeleteRow(keys) => RowKey(keys.clone()),
            WireCommand::WriteVersionedRow(row) => RowKey(row.keys.clone()),
        }
    }
}

/// Transaction context threaded through `execute_writes`.
#[derive(Debug)]
pub struct WriteContext {
    pub txn_id: TxnId,
    pub start_ts: Timestamp,
    /// Set when the writes are executed at commit time (ordered tablets).
    pub commit_ts: Timestamp,
    /// Rows locked by the batch, without duplicates.
    pub locked_rows: Vec<DynamicRowRef>,
    pub row_count: usize,
}

impl WriteContext {
    pub fn new(txn_id: TxnId, start_ts: Timestamp) -> Self {
        Self {
            txn_id,
            start_ts,
            commit_ts: Timestamp::NULL,
            locked_rows: Vec::new(),
            row_count: 0,
        }
    }

    pub fn at_commit(txn_id: TxnId, start_ts: Timestamp, commit_ts: Timestamp) -> Self {
        Self {
            commit_ts,
            ..Self::new(txn_id, start_ts)
        }
    }

    pub(crate) fn add_locked_row(&mut self, row_ref: DynamicRowRef) {
        if !self.locked_rows.iter().any(|r| r.same_row(&row_ref)) {
            self.locked_rows.push(row_ref);
        }
    }
}

/// State every store manager shares: the tablet, rotation bookkeeping and
/// the background activity registry.
pub struct StoreManagerBase {
    tablet: Tablet,
    supervisor: Arc<BgActivitySupervisor>,
    rotation_scheduled: bool,
    last_rotated: Instant,
}

impl StoreManagerBase {
    pub fn new(tablet: Tablet, supervisor: Arc<BgActivitySupervisor>) -> Self {
        Self {
            tablet,
            supervisor,
            rotation_scheduled: false,
            last_rotated: Instant::now(),
        }
    }

    pub fn tablet(&self) -> &Tablet {
        &self.tablet
    }

    pub fn tablet_mut(&mut self) -> &mut Tablet {
        &mut self.tablet
    }

    pub fn supervisor(&self) -> &Arc<BgActivitySupervisor> {
        &self.supervisor
    }

    fn subject(&self, id: StoreId) -> String {
        format!("{}/{}", self.tablet.id(), id)
    }

    fn backoff(&self, kind: ActivityKind) -> Duration {
        let backoff = &self.tablet.config().backoff;
        Duration::from_millis(match kind {
            ActivityKind::Flush => backoff.flush_error_backoff_ms,
            ActivityKind::Compaction => backoff.compaction_error_backoff_ms,
            ActivityKind::Rotation | ActivityKind::Pull => backoff.rotation_error_backoff_ms,
        })
    }

    fn store(&self, id: StoreId) -> TabletResult<Store> {
        self.tablet
            .find_store(id)
            .cloned()
            .ok_or(TabletError::NoSuchStore(id))
    }

    fn is_backing_off(&self, kind: ActivityKind, id: StoreId) -> bool {
        self.supervisor.is_backing_off(kind, &self.subject(id))
    }
}

fn store_lock_count(store: &Store) -> i64 {
    store.as_sorted_dynamic().map(|s| s.lock_count()).unwrap_or(0)
}

fn activity_ready(state: StoreActivityState, backing_off: bool) -> bool {
    match state {
        StoreActivityState::None => true,
        StoreActivityState::Failed => !backing_off,
        StoreActivityState::Running | StoreActivityState::Complete => false,
    }
}

/// Store management capability of a tablet.
///
/// Implementors supply the store kind specific parts; rotation, flush and
/// compaction bookkeeping are shared.
pub trait StoreManager {
    fn base(&self) -> &StoreManagerBase;
    fn base_mut(&mut self) -> &mut StoreManagerBase;

    /// Creates an empty store of the tablet's kind.
    fn create_active_store(&mut self) -> TabletResult<Store>;

    /// Executes a batch. Sorted tablets lock rows; ordered tablets append
    /// at `ctx.commit_ts`.
    fn execute_writes(&mut self, commands: &[WireCommand], ctx: &mut WriteContext) -> TabletResult<()>;

    fn tablet(&self) -> &Tablet {
        self.base().tablet()
    }

    fn tablet_mut(&mut self) -> &mut Tablet {
        self.base_mut().tablet_mut()
    }

    /// Installs the first active store of a fresh tablet.
    fn mount(&mut self) -> TabletResult<()> {
        if self.tablet().active_store().is_none() {
            let store = self.create_active_store()?;
            self.tablet_mut().add_store(store.clone(), None)?;
            self.tablet_mut().set_active_store(Some(store));
            self.tablet().publish_snapshot();
        }
        Ok(())
    }

    /// True while any dynamic store still holds a row lock.
    fn has_active_locks(&self) -> bool {
        self.tablet().stores().any(|s| store_lock_count(s) > 0)
    }

    fn has_unflushed_stores(&self) -> bool {
        self.tablet()
            .stores()
            .any(|s| s.is_dynamic() && s.row_count() > 0)
    }

    fn is_overflow_rotation_needed(&self) -> bool {
        let config = self.tablet().config();
        match self.tablet().active_store() {
            Some(Store::SortedDynamic(s)) => {
                s.row_count() >= config.max_dynamic_store_row_count
                    || s.value_count() >= config.max_dynamic_store_value_count
                    || s.timestamp_count() >= config.max_dynamic_store_timestamp_count
                    || s.pool_size() >= config.max_dynamic_store_pool_size
            }
            Some(Store::OrderedDynamic(s)) => {
                s.row_count() >= config.max_dynamic_store_row_count
                    || s.timestamp_count() >= config.max_dynamic_store_timestamp_count
                    || s.pool_size() >= config.max_dynamic_store_pool_size
            }
            _ => false,
        }
    }

    fn is_periodic_rotation_needed(&self) -> bool {
        let period = self.tablet().config().dynamic_store_auto_flush_period_ms;
        if period == 0 {
            return false;
        }
        let non_empty = self
            .tablet()
            .active_store()
            .map(|s| s.row_count() > 0)
            .unwrap_or(false);
        non_empty && self.base().last_rotated.elapsed() >= Duration::from_millis(period)
    }

    /// Rotation may run now: nothing scheduled, a non-empty active store,
    /// and no row locks in it.
    fn is_rotation_possible(&self) -> bool {
        if self.is_rotation_scheduled() {
            return false;
        }
        match self.tablet().active_store() {
            Some(store) => store.row_count() > 0 && store_lock_count(store) == 0,
            None => false,
        }
    }

    /// Like [`StoreManager::is_rotation_possible`] but ignores row locks.
    fn is_forced_rotation_possible(&self) -> bool {
        if self.is_rotation_scheduled() {
            return false;
        }
        self.tablet()
            .active_store()
            .map(|s| s.row_count() > 0)
            .unwrap_or(false)
    }

    fn is_rotation_scheduled(&self) -> bool {
        self.base().rotation_scheduled
    }

    fn schedule_rotation(&mut self) {
        if !self.base().rotation_scheduled {
            self.base_mut().rotation_scheduled = true;
            tracing::debug!(tablet_id = %self.tablet().id(), "store rotation scheduled");
        }
    }

    fn unschedule_rotation(&mut self) {
        self.base_mut().rotation_scheduled = false;
    }

    /// Demotes the active store to passive and optionally installs a new one.
    fn rotate(&mut self, create_new_store: bool) -> TabletResult<()> {
        self.base_mut().rotation_scheduled = false;
        self.base_mut().last_rotated = Instant::now();
        if let Some(old) = self.tablet().active_store().cloned() {
            old.meta().set_state(StoreState::PassiveDynamic);
            tracing::info!(
                tablet_id = %self.tablet().id(),
                store_id = %old.id(),
                row_count = old.row_count(),
                locks = store_lock_count(&old),
                "active store rotated"
            );
        }
        self.tablet_mut().set_active_store(None);
        if create_new_store {
            let store = self.create_active_store()?;
            self.tablet_mut().add_store(store.clone(), None)?;
            self.tablet_mut().set_active_store(Some(store));
        }
        self.tablet().publish_snapshot();
        metrics::counter!("tablet_store_rotations_total").increment(1);
        metrics::gauge!("tablet_store_count").set(self.tablet().stores().count() as f64);
        Ok(())
    }

    fn add_store(&mut self, store: Store, partition: Option<PartitionId>) -> TabletResult<()> {
        self.tablet_mut().add_store(store, partition)?;
        self.tablet().publish_snapshot();
        Ok(())
    }

    /// Removes a store that no longer serves writes.
    fn remove_store(&mut self, id: StoreId) -> TabletResult<Store> {
        let store = self.base().store(id)?;
        if store.state() == StoreState::ActiveDynamic {
            return Err(TabletError::internal(
                "REMOVE_ACTIVE_STORE",
                format!("{} is active and cannot be removed", id),
            ));
        }
        if store_lock_count(&store) > 0 {
            return Err(TabletError::internal(
                "REMOVE_LOCKED_STORE",
                format!("{} still holds row locks", id),
            ));
        }
        let subject = self.base().subject(id);
        self.base().supervisor.forget(&subject);
        let removed = self.tablet_mut().remove_store(id).ok_or(TabletError::NoSuchStore(id))?;
        self.tablet().publish_snapshot();
        Ok(removed)
    }

    fn is_store_flushable(&self, id: StoreId) -> bool {
        let Some(store) = self.tablet().find_store(id) else {
            return false;
        };
        let status = store.meta().status();
        status.state == StoreState::PassiveDynamic
            && activity_ready(status.flush_state, self.base().is_backing_off(ActivityKind::Flush, id))
            && store_lock_count(store) == 0
    }

    /// Marks the store as flushing and hands out the callback that builds its chunk.
    fn begin_store_flush(&mut self, id: StoreId) -> TabletResult<StoreFlushCallback> {
        if !self.is_store_flushable(id) {
            return Err(TabletError::internal(
                "STORE_NOT_FLUSHABLE",
                format!("{} cannot be flushed now", id),
            ));
        }
        let store = self.base().store(id)?;
        store.meta().set_flush_state(StoreActivityState::Running);
        let subject = self.base().subject(id);
        self.base().supervisor.report_started(ActivityKind::Flush, &subject);
        let callback: StoreFlushCallback = match store {
            Store::SortedDynamic(s) => Box::new(move || {
                Ok(FlushedChunk {
                    source_store_id: s.id(),
                    rows: ChunkRows::Sorted(s.committed_rows()),
                    min_timestamp: s.min_timestamp(),
                    max_timestamp: s.max_timestamp(),
                })
            }),
            Store::OrderedDynamic(s) => Box::new(move || {
                Ok(FlushedChunk {
                    source_store_id: s.id(),
                    rows: ChunkRows::Ordered {
                        starting_row_index: s.starting_row_index(),
                        rows: s.get_all_rows(),
                    },
                    min_timestamp: s.min_timestamp(),
                    max_timestamp: s.max_timestamp(),
                })
            }),
            other => {
                return Err(TabletError::internal(
                    "STORE_NOT_FLUSHABLE",
                    format!("{:?} is not dynamic", other),
                ))
            }
        };
        Ok(callback)
    }

    /// Replaces the flushed dynamic store by its chunk. Returns the chunk store id.
    fn end_store_flush(&mut self, id: StoreId, chunk: FlushedChunk) -> TabletResult<StoreId> {
        let store = self.base().store(id)?;
        let chunk_id = self.tablet_mut().generate_store_id();
        let chunk_store = if store.is_sorted() {
            Store::SortedChunk(Arc::new(SortedChunkStore::from_chunk(chunk_id, chunk)?))
        } else {
            Store::OrderedChunk(Arc::new(OrderedChunkStore::from_chunk(chunk_id, chunk)?))
        };
        store.meta().set_flush_state(StoreActivityState::Complete);
        self.tablet_mut().add_store(chunk_store, None)?;
        self.tablet_mut().remove_store(id);
        self.tablet().publish_snapshot();

        let subject = self.base().subject(id);
        self.base().supervisor.report_succeeded(ActivityKind::Flush, &subject);
        self.base().supervisor.forget(&subject);
        metrics::counter!("tablet_store_flushes_total").increment(1);
        tracing::info!(tablet_id = %self.tablet().id(), store_id = %id, chunk_store_id = %chunk_id, "store flushed");
        Ok(chunk_id)
    }

    /// Records a failed flush; the store becomes flushable again after the backoff.
    fn backoff_store_flush(&mut self, id: StoreId, reason: &str) {
        if let Some(store) = self.tablet().find_store(id) {
            store.meta().set_flush_state(StoreActivityState::Failed);
        }
        let subject = self.base().subject(id);
        let backoff = self.base().backoff(ActivityKind::Flush);
        self.base().supervisor.report_failed(ActivityKind::Flush, &subject, reason, backoff);
    }

    /// Runs a whole flush inline. Failures are reported and backed off, not returned.
    fn flush_store(&mut self, id: StoreId) -> Option<StoreId> {
        let callback = match self.begin_store_flush(id) {
            Ok(cb) => cb,
            Err(e) => {
                tracing::debug!(store_id = %id, error = %e, "store flush not started");
                return None;
            }
        };
        match callback().and_then(|chunk| self.end_store_flush(id, chunk)) {
            Ok(chunk_id) => Some(chunk_id),
            Err(e) => {
                self.backoff_store_flush(id, &e.to_string());
                None
            }
        }
    }

    fn is_store_compactable(&self, id: StoreId) -> bool {
        let Some(store) = self.tablet().find_store(id) else {
            return false;
        };
        let status = store.meta().status();
        matches!(store, Store::SortedChunk(_))
            && status.state == StoreState::Persistent
            && activity_ready(
                status.compaction_state,
                self.base().is_backing_off(ActivityKind::Compaction, id),
            )
    }

    /// Hands out a callback merging `ids` into one chunk. Versions below
    /// `major_timestamp` that no reader can see are dropped.
    fn begin_store_compaction(
        &mut self,
        ids: &[StoreId],
        major_timestamp: Timestamp,
    ) -> TabletResult<StoreCompactionCallback> {
        let mut stores = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.is_store_compactable(*id) {
                return Err(TabletError::internal(
                    "STORE_NOT_COMPACTABLE",
                    format!("{} cannot be compacted now", id),
                ));
            }
            match self.base().store(*id)? {
                Store::SortedChunk(s) => stores.push(s),
                other => {
                    return Err(TabletError::internal(
                        "STORE_NOT_COMPACTABLE",
                        format!("{:?} is not a sorted chunk", other),
                    ))
                }
            }
        }
        for s in &stores {
            s.meta().set_compaction_state(StoreActivityState::Running);
            let subject = self.base().subject(s.id());
            self.base().supervisor.report_started(ActivityKind::Compaction, &subject);
        }
        let schema = self.tablet().schema().clone();
        let source_store_id = ids.first().copied().unwrap_or(StoreId(0));
        Ok(Box::new(move || {
            let mut by_key: BTreeMap<RowKey, Vec<VersionedRow>> = BTreeMap::new();
            let mut min_timestamp = Timestamp::MAX;
            let mut max_timestamp = Timestamp::MIN;
            for s in &stores {
                min_timestamp = min_timestamp.min(s.min_timestamp());
                max_timestamp = max_timestamp.max(s.max_timestamp());
                for row in s.rows() {
                    by_key.entry(RowKey(row.keys.clone())).or_default().push(row.clone());
                }
            }
            let mut merger = VersionedRowMerger::new(schema, Timestamp::MAX, major_timestamp, None);
            let rows = by_key.into_values().filter_map(|rows| merger.merge(rows)).collect();
            Ok(FlushedChunk {
                source_store_id,
                rows: ChunkRows::Sorted(rows),
                min_timestamp,
                max_timestamp,
            })
        }))
    }

    /// Replaces the compacted stores by the new chunk, placed in the
    /// partition that contains it or in Eden.
    fn end_store_compaction(&mut self, ids: &[StoreId], chunk: FlushedChunk) -> TabletResult<StoreId> {
        let chunk_id = self.tablet_mut().generate_store_id();
        let store = SortedChunkStore::from_chunk(chunk_id, chunk)?;
        let partition = self
            .tablet()
            .containing_partition(&store.min_key(), &store.max_key());
        for id in ids {
            let subject = self.base().subject(*id);
            self.base().supervisor.report_succeeded(ActivityKind::Compaction, &subject);
            self.base().supervisor.forget(&subject);
            if let Some(old) = self.tablet_mut().remove_store(*id) {
                old.meta().set_compaction_state(StoreActivityState::Complete);
            }
        }
        self.tablet_mut()
            .add_store(Store::SortedChunk(Arc::new(store)), partition)?;
        self.tablet().publish_snapshot();
        metrics::counter!("tablet_store_compactions_total").increment(1);
        tracing::info!(
            tablet_id = %self.tablet().id(),
            stores = ids.len(),
            chunk_store_id = %chunk_id,
            "stores compacted"
        );
        Ok(chunk_id)
    }

    fn backoff_store_compaction(&mut self, ids: &[StoreId], reason: &str) {
        let backoff = self.base().backoff(ActivityKind::Compaction);
        for id in ids {
            if let Some(store) = self.tablet().find_store(*id) {
                store.meta().set_compaction_state(StoreActivityState::Failed);
            }
            let subject = self.base().subject(*id);
            self.base()
                .supervisor
                .report_failed(ActivityKind::Compaction, &subject, reason, backoff);
        }
    }

    fn split_partition(&mut self, index: usize, pivot_keys: Vec<RowKey>) -> TabletResult<Vec<PartitionId>> {
        let ids = self.tablet_mut().split_partition(index, pivot_keys)?;
        self.tablet().publish_snapshot();
        Ok(ids)
    }

    fn merge_partitions(&mut self, first: usize, last: usize) -> TabletResult<PartitionId> {
        let id = self.tablet_mut().merge_partitions(first, last)?;
        self.tablet().publish_snapshot();
        Ok(id)
    }

    fn update_partition_sample_keys(&mut self, id: PartitionId, sample_keys: Vec<RowKey>) -> TabletResult<()> {
        self.tablet_mut().update_partition_sample_keys(id, sample_keys)?;
        self.tablet().publish_snapshot();
        Ok(())
    }

    /// Adds externally built chunk stores (bulk insert).
    fn bulk_add_stores(&mut self, stores: Vec<Store>) -> TabletResult<()> {
        for store in stores {
            let partition = self
                .tablet()
                .containing_partition(&store.min_key(), &store.max_key());
            self.tablet_mut().add_store(store, partition)?;
        }
        self.tablet().publish_snapshot();
        Ok(())
    }

    /// Drops every store and starts over with an empty active store.
    fn discard_all_stores(&mut self) -> TabletResult<()> {
        if self.has_active_locks() {
            return Err(TabletError::internal(
                "DISCARD_LOCKED_STORES",
                "cannot discard stores while rows are locked",
            ));
        }
        let removed = self.tablet_mut().clear_stores();
        for store in &removed {
            let subject = self.base().subject(store.id());
            self.base().supervisor.forget(&subject);
        }
        tracing::info!(tablet_id = %self.tablet().id(), stores = removed.len(), "all stores discarded");
        let store = self.create_active_store()?;
        self.tablet_mut().add_store(store.clone(), None)?;
        self.tablet_mut().set_active_store(Some(store));
        self.tablet().publish_snapshot();
        Ok(())
    }
}

/// The store manager of one tablet.
pub enum TabletStoreManager {
    Sorted(SortedStoreManager),
    Ordered(OrderedStoreManager),
    Replicated(ReplicatedStoreManager),
}

impl TabletStoreManager {
    pub fn as_dyn(&self) -> &dyn StoreManager {
        match self {
            TabletStoreManager::Sorted(m) => m,
            TabletStoreManager::Ordered(m) => m,
            TabletStoreManager::Replicated(m) => m,
        }
    }

    pub fn as_dyn_mut(&mut self) -> &mut dyn StoreManager {
        match self {
            TabletStoreManager::Sorted(m) => m,
            TabletStoreManager::Ordered(m) => m,
            TabletStoreManager::Replicated(m) => m,
        }
    }

    pub fn as_sorted(&self) -> Option<&SortedStoreManager> {
        match self {
            TabletStoreManager::Sorted(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sorted_mut(&mut self) -> Option<&mut SortedStoreManager> {
        match self {
            TabletStoreManager::Sorted(m) => Some(m),
            _ => None,
        }
    }

    pub fn tablet(&self) -> &Tablet {
        self.as_dyn().tablet()
    }

    /// Ordered and replicated tablets write at commit time; sorted tablets lock on apply.
    pub fn writes_at_commit(&self) -> bool {
        !matches!(self, TabletStoreManager::Sorted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::config::{BackoffConfig, TabletManagerConfig};
    use tablet_common::schema::TableSchema;
    use tablet_common::types::TabletId;
    use tablet_common::value::{UnversionedValue, ValueType};

    fn manager(config: TabletManagerConfig) -> SortedStoreManager {
        let schema = Arc::new(TableSchema::sorted(&[ValueType::Int64], &[ValueType::Int64]));
        let tablet = Tablet::new(TabletId(1), schema, Arc::new(config));
        let mut m = SortedStoreManager::new(tablet, Arc::new(BgActivitySupervisor::new()));
        m.mount().unwrap();
        m
    }

    fn immediate() -> TabletManagerConfig {
        TabletManagerConfig {
            backoff: BackoffConfig::immediate(),
            ..TabletManagerConfig::default()
        }
    }

    fn write(m: &mut SortedStoreManager, txn: u64, k: i64, v: i64, commit_ts: u64) {
        let mut ctx = WriteContext::new(TxnId(txn), Timestamp(commit_ts - 1));
        let row = UnversionedRow::new(vec![UnversionedValue::new(0, k), UnversionedValue::new(1, v)]);
        m.execute_writes(&[WireCommand::WriteRow(row)], &mut ctx).unwrap();
        for r in &ctx.locked_rows {
            m.commit_row(r, TxnId(txn), Timestamp(commit_ts)).unwrap();
        }
    }

    fn active_id(m: &SortedStoreManager) -> StoreId {
        m.tablet().active_store().unwrap().id()
    }

    #[test]
    fn test_rotation_preconditions() {
        let mut m = manager(immediate());
        // empty active store
        assert!(!m.is_rotation_possible());
        write(&mut m, 1, 1, 10, 0x20);
        assert!(m.is_rotation_possible());

        m.schedule_rotation();
        assert!(m.is_rotation_scheduled());
        assert!(!m.is_rotation_possible());
        m.unschedule_rotation();

        let old = active_id(&m);
        m.rotate(true).unwrap();
        assert_ne!(active_id(&m), old);
        assert_eq!(m.tablet().find_store(old).unwrap().state(), StoreState::PassiveDynamic);
        assert!(!m.is_rotation_scheduled());
    }

    #[test]
    fn test_locked_rows_block_rotation_unless_forced() {
        let mut m = manager(immediate());
        let mut ctx = WriteContext::new(TxnId(1), Timestamp(1));
        let row = UnversionedRow::new(vec![UnversionedValue::new(0, 1i64), UnversionedValue::new(1, 1i64)]);
        m.execute_writes(&[WireCommand::WriteRow(row)], &mut ctx).unwrap();
        assert!(!m.is_rotation_possible());
        assert!(m.is_forced_rotation_possible());

        let old = active_id(&m);
        m.rotate(true).unwrap();
        // still locked, not flushable
        assert!(!m.is_store_flushable(old));
        m.abort_row(&ctx.locked_rows[0], TxnId(1));
        assert!(m.is_store_flushable(old));
    }

    #[test]
    fn test_flush_replaces_dynamic_store() {
        let mut m = manager(immediate());
        write(&mut m, 1, 1, 10, 0x20);
        write(&mut m, 2, 2, 20, 0x30);
        let old = active_id(&m);
        m.rotate(true).unwrap();

        let chunk_id = m.flush_store(old).unwrap();
        assert!(m.tablet().find_store(old).is_none());
        let chunk = m.tablet().find_store(chunk_id).unwrap();
        assert_eq!(chunk.state(), StoreState::Persistent);
        assert_eq!(chunk.row_count(), 2);
        assert!(!m.has_unflushed_stores());
    }

    #[test]
    fn test_flush_backoff_is_retryable() {
        let mut m = manager(TabletManagerConfig::default());
        write(&mut m, 1, 1, 10, 0x20);
        let old = active_id(&m);
        m.rotate(true).unwrap();

        let _cb = m.begin_store_flush(old).unwrap();
        assert!(!m.is_store_flushable(old));
        m.backoff_store_flush(old, "chunk writer failed");
        // default backoff is a minute
        assert!(!m.is_store_flushable(old));
        assert_eq!(
            m.tablet().find_store(old).unwrap().meta().flush_state(),
            StoreActivityState::Failed
        );

        let mut m = manager(immediate());
        write(&mut m, 1, 1, 10, 0x20);
        let old = active_id(&m);
        m.rotate(true).unwrap();
        let _cb = m.begin_store_flush(old).unwrap();
        m.backoff_store_flush(old, "chunk writer failed");
        assert!(m.is_store_flushable(old));
        assert!(m.flush_store(old).is_some());
    }

    #[test]
    fn test_compaction_moves_chunk_into_partition() {
        let mut m = manager(immediate());
        let mut chunks = Vec::new();
        for (txn, k) in [(1u64, 1i64), (2, 2)] {
            write(&mut m, txn, k, k * 10, 0x20 + txn);
            let old = active_id(&m);
            m.rotate(true).unwrap();
            chunks.push(m.flush_store(old).unwrap());
        }
        assert!(chunks.iter().all(|id| m.is_store_compactable(*id)));
        let cb = m.begin_store_compaction(&chunks, Timestamp::NULL).unwrap();
        assert!(!m.is_store_compactable(chunks[0]));
        let merged = cb().unwrap();
        assert_eq!(merged.rows.row_count(), 2);
        let id = m.end_store_compaction(&chunks, merged).unwrap();
        let partition = m.tablet().store_partition(id).unwrap();
        assert_eq!(partition, m.tablet().partitions()[0].id);
        assert!(m.tablet().find_store(chunks[0]).is_none());
    }

    #[test]
    fn test_compaction_backoff() {
        let mut m = manager(TabletManagerConfig::default());
        write(&mut m, 1, 1, 10, 0x20);
        let old = active_id(&m);
        m.rotate(true).unwrap();
        let chunk = m.flush_store(old).unwrap();
        let _cb = m.begin_store_compaction(&[chunk], Timestamp::NULL).unwrap();
        m.backoff_store_compaction(&[chunk], "merge failed");
        assert!(!m.is_store_compactable(chunk));
        let info = m
            .base()
            .supervisor()
            .info(ActivityKind::Compaction, &format!("{}/{}", TabletId(1), chunk))
            .unwrap();
        assert_eq!(info.failure_count, 1);
    }

    #[test]
    fn test_overflow_rotation() {
        let mut m = manager(TabletManagerConfig {
            max_dynamic_store_row_count: 2,
            ..immediate()
        });
        write(&mut m, 1, 1, 10, 0x20);
        assert!(!m.is_overflow_rotation_needed());
        write(&mut m, 2, 2, 10, 0x21);
        assert!(m.is_overflow_rotation_needed());
        assert!(!m.is_periodic_rotation_needed());
    }

    #[test]
    fn test_remove_and_discard() {
        let mut m = manager(immediate());
        write(&mut m, 1, 1, 10, 0x20);
        let active = active_id(&m);
        assert!(m.remove_store(active).is_err());
        m.discard_all_stores().unwrap();
        assert_eq!(m.tablet().store_count(), 1);
        assert_ne!(active_id(&m), active);
        assert!(m.tablet().find_store(active).is_none());
    }
}
