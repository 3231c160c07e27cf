use std::collections::BTreeMap;
use std::sync::Arc;

use tablet_common::bg_supervisor::BgActivitySupervisor;
use tablet_common::error::{LockConflictWinner, TabletError, TabletResult};
use tablet_common::types::{Timestamp, TxnId};
use tablet_common::value::VersionedRow;

use crate::comparer::RowKey;
use crate::dynamic_row::LockMask;
use crate::sorted_dynamic_store::{check_timestamp_order, DynamicRowRef, SortedDynamicStore};
use crate::store::{Store, StoreState};
use crate::tablet::Tablet;

use super::{StoreManager, StoreManagerBase, WireCommand, WriteContext};

/// Store manager of a sorted tablet.
///
/// Writes lock rows in the active store. A forced rotation may leave locked
/// rows behind in passive stores; those stores are consulted by every lock
/// check until their locks drain, and a transaction keeps writing to the row
/// it already holds there.
pub struct SortedStoreManager {
    base: StoreManagerBase,
}

impl SortedStoreManager {
    pub fn new(tablet: Tablet, supervisor: Arc<BgActivitySupervisor>) -> Self {
        Self {
            base: StoreManagerBase::new(tablet, supervisor),
        }
    }

    fn active_store(&self) -> TabletResult<Arc<SortedDynamicStore>> {
        self.base
            .tablet()
            .active_store()
            .and_then(|s| s.as_sorted_dynamic().cloned())
            .ok_or_else(|| {
                TabletError::internal(
                    "NO_ACTIVE_STORE",
                    format!("{} has no active sorted store", self.base.tablet().id()),
                )
            })
    }

    /// Passive dynamic stores that still hold row locks.
    fn locked_stores(&self) -> Vec<Arc<SortedDynamicStore>> {
        self.base
            .tablet()
            .stores()
            .filter_map(|s| s.as_sorted_dynamic())
            .filter(|s| s.lock_count() > 0 && s.meta().state() != StoreState::ActiveDynamic)
            .cloned()
            .collect()
    }

    fn lock_mask(store: &SortedDynamicStore, command: &WireCommand) -> LockMask {
        match command {
            WireCommand::WriteRow(row) => store.write_lock_mask(row),
            WireCommand::ReadLockWriteRow { locks, row } => {
                let has_values = row
                    .values
                    .iter()
                    .any(|v| !store.schema().is_key_column(v.id));
                if has_values {
                    locks.union(store.write_lock_mask(row))
                } else {
                    *locks
                }
            }
            WireCommand::DeleteRow(_) => store.delete_lock_mask(),
            WireCommand::WriteVersionedRow(_) => LockMask::primary(),
        }
    }

    /// Existing rows for `key` in the active store and in locked passive stores.
    fn existing_rows(&self, key: &RowKey) -> TabletResult<Vec<DynamicRowRef>> {
        let active = self.active_store()?;
        let mut rows = Vec::new();
        if let Some(row) = active.find_row(key) {
            rows.push(DynamicRowRef::new(active, row));
        }
        for store in self.locked_stores() {
            if let Some(row) = store.find_row(key) {
                rows.push(DynamicRowRef::new(store, row));
            }
        }
        Ok(rows)
    }

    /// Fails fast if `txn` cannot take the locks `command` needs.
    pub fn check_row(&self, txn: TxnId, start_ts: Timestamp, command: &WireCommand) -> TabletResult<()> {
        let active = self.active_store()?;
        let key = command.key(self.base.tablet().schema().key_column_count);
        let mask = Self::lock_mask(&active, command);
        for r in self.existing_rows(&key)? {
            r.store.check_row_locks(&r.row, txn, start_ts, mask)?;
        }
        Ok(())
    }

    /// Row `txn` should lock for `key`: the one it already holds in a
    /// passive store, else the active store's.
    fn target_row(&self, txn: TxnId, key: RowKey) -> TabletResult<DynamicRowRef> {
        for store in self.locked_stores() {
            if let Some(row) = store.find_row(&key) {
                if row.is_locked_by(txn) {
                    return Ok(DynamicRowRef::new(store, row));
                }
            }
        }
        let active = self.active_store()?;
        let row = active.write_row(key);
        Ok(DynamicRowRef::new(active, row))
    }

    /// Takes the locks of `command` without staging values (leader prelock).
    pub fn prelock_row(&mut self, txn: TxnId, start_ts: Timestamp, command: &WireCommand) -> TabletResult<DynamicRowRef> {
        self.check_row(txn, start_ts, command)?;
        let key = command.key(self.base.tablet().schema().key_column_count);
        let target = self.target_row(txn, key)?;
        let mask = Self::lock_mask(&target.store, command);
        target.store.acquire_row_locks(&target.row, txn, mask);
        Ok(target)
    }

    /// Takes the locks of `command` (if not held yet) and stages its values.
    pub fn lock_row(&mut self, txn: TxnId, start_ts: Timestamp, command: &WireCommand) -> TabletResult<DynamicRowRef> {
        let target = self.prelock_row(txn, start_ts, command)?;
        match command {
            WireCommand::WriteRow(row) | WireCommand::ReadLockWriteRow { row, .. } => {
                target.store.prepare_write(&target.row, row)?;
            }
            WireCommand::DeleteRow(_) => target.store.prepare_delete(&target.row)?,
            WireCommand::WriteVersionedRow(_) => {
                return Err(TabletError::internal(
                    "VERSIONED_ROW_LOCK",
                    "versioned rows are written directly, not locked",
                ))
            }
        }
        Ok(target)
    }

    pub fn prepare_row(&self, row_ref: &DynamicRowRef, txn: TxnId, prepare_ts: Timestamp) {
        row_ref.store.prepare_row(&row_ref.row, txn, prepare_ts);
    }

    pub fn commit_row(&self, row_ref: &DynamicRowRef, txn: TxnId, commit_ts: Timestamp) -> TabletResult<()> {
        row_ref.store.commit_row(&row_ref.row, txn, commit_ts)
    }

    pub fn abort_row(&self, row_ref: &DynamicRowRef, txn: TxnId) {
        row_ref.store.abort_row(&row_ref.row, txn);
    }

    /// Drops locks without touching staged values (prelocks that were never applied).
    pub fn release_row(&self, row_ref: &DynamicRowRef, txn: TxnId) {
        row_ref.store.release_row_locks(&row_ref.row, txn);
    }

    /// Versioned writes may not touch a row still locked in a passive store.
    fn check_passive_locks(&self, key: &RowKey) -> TabletResult<()> {
        for r in self.locked_stores() {
            if let Some(existing) = r.find_row(key) {
                if let Some(owner) = existing.locks().iter().find_map(|l| l.transaction()) {
                    return Err(TabletError::LockConflict {
                        txn_id: TxnId::NONE,
                        key: key.to_string(),
                        lock_index: 0,
                        winner: LockConflictWinner::Transaction(owner),
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks a batch of versioned rows without writing any of them. Rows of
    /// the same key must also come in timestamp order within the batch.
    pub fn check_versioned_rows<'a>(&self, rows: impl IntoIterator<Item = &'a VersionedRow>) -> TabletResult<()> {
        let active = self.active_store()?;
        let mut batch_latest: BTreeMap<RowKey, Timestamp> = BTreeMap::new();
        for row in rows {
            let key = RowKey(row.keys.clone());
            self.check_passive_locks(&key)?;
            active.check_versioned_row(row)?;
            if let Some(&latest) = batch_latest.get(&key) {
                check_timestamp_order(&key, latest, row)?;
            }
            if let Some((_, newest)) = row.timestamp_range() {
                let latest = batch_latest.entry(key).or_insert(newest);
                *latest = (*latest).max(newest);
            }
        }
        Ok(())
    }

    pub fn write_versioned_row(&mut self, row: &VersionedRow) -> TabletResult<()> {
        self.check_passive_locks(&RowKey(row.keys.clone()))?;
        self.active_store()?.write_versioned_row(row)?;
        Ok(())
    }
}

impl StoreManager for SortedStoreManager {
    fn base(&self) -> &StoreManagerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StoreManagerBase {
        &mut self.base
    }

    fn create_active_store(&mut self) -> TabletResult<Store> {
        let tablet = self.base.tablet_mut();
        let id = tablet.generate_store_id();
        let store = SortedDynamicStore::new(
            id,
            tablet.id(),
            tablet.schema().clone(),
            tablet.config().edit_list.clone(),
        );
        tracing::debug!(tablet_id = %tablet.id(), store_id = %id, "sorted dynamic store created");
        Ok(Store::SortedDynamic(Arc::new(store)))
    }

    /// Checks every command first so a conflict leaves nothing locked or
    /// written, then locks and stages. Versioned rows are written immediately.
    fn execute_writes(&mut self, commands: &[WireCommand], ctx: &mut WriteContext) -> TabletResult<()> {
        for command in commands.iter().filter(|c| !c.is_versioned()) {
            self.check_row(ctx.txn_id, ctx.start_ts, command)?;
        }
        self.check_versioned_rows(commands.iter().filter_map(|c| match c {
            WireCommand::WriteVersionedRow(row) => Some(row),
            _ => None,
        }))?;
        for command in commands {
            if let WireCommand::WriteVersionedRow(row) = command {
                self.write_versioned_row(row)?;
            } else {
                let row_ref = self.lock_row(ctx.txn_id, ctx.start_ts, command)?;
                ctx.add_locked_row(row_ref);
            }
            ctx.row_count += 1;
        }
        Ok(())
    }
}
