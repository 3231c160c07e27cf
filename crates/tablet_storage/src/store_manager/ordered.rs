use std::sync::Arc;

use tablet_common::bg_supervisor::BgActivitySupervisor;
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::{PartitionId, Timestamp};
use tablet_common::value::UnversionedRow;

use crate::comparer::RowKey;
use crate::ordered_dynamic_store::OrderedDynamicStore;
use crate::store::Store;
use crate::tablet::Tablet;

use super::{StoreManager, StoreManagerBase, WireCommand, WriteContext};

/// Store manager of an ordered tablet. Rows take no locks and are appended
/// to the active store when their transaction commits.
pub struct OrderedStoreManager {
    base: StoreManagerBase,
}

impl OrderedStoreManager {
    pub fn new(tablet: Tablet, supervisor: Arc<BgActivitySupervisor>) -> Self {
        Self {
            base: StoreManagerBase::new(tablet, supervisor),
        }
    }

    fn active_store(&self) -> TabletResult<Arc<OrderedDynamicStore>> {
        self.base
            .tablet()
            .active_store()
            .and_then(|s| s.as_ordered_dynamic().cloned())
            .ok_or_else(|| {
                TabletError::internal(
                    "NO_ACTIVE_STORE",
                    format!("{} has no active ordered store", self.base.tablet().id()),
                )
            })
    }

    /// Appends one row at `commit_ts`; returns its row index.
    pub fn write_row(&mut self, row: UnversionedRow, commit_ts: Timestamp) -> TabletResult<u64> {
        self.active_store()?.write_row(row, commit_ts)
    }

    fn unsupported(&self, operation: &str) -> TabletError {
        TabletError::Unsupported(format!(
            "{} is not supported for ordered tablet {}",
            operation,
            self.base.tablet().id()
        ))
    }
}

impl StoreManager for OrderedStoreManager {
    fn base(&self) -> &StoreManagerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StoreManagerBase {
        &mut self.base
    }

    fn create_active_store(&mut self) -> TabletResult<Store> {
        let tablet = self.base.tablet_mut();
        let id = tablet.generate_store_id();
        let starting_row_index = tablet.next_ordered_row_index();
        let store = OrderedDynamicStore::new(id, tablet.id(), tablet.schema().clone(), starting_row_index);
        tracing::debug!(
            tablet_id = %tablet.id(),
            store_id = %id,
            starting_row_index,
            "ordered dynamic store created"
        );
        Ok(Store::OrderedDynamic(Arc::new(store)))
    }

    fn execute_writes(&mut self, commands: &[WireCommand], ctx: &mut WriteContext) -> TabletResult<()> {
        if ctx.commit_ts == Timestamp::NULL {
            return Err(TabletError::internal(
                "ORDERED_WRITE_WITHOUT_COMMIT",
                format!("ordered writes of {} need a commit timestamp", ctx.txn_id),
            ));
        }
        for command in commands {
            match command {
                WireCommand::WriteRow(row) => {
                    self.write_row(row.clone(), ctx.commit_ts)?;
                    ctx.row_count += 1;
                }
                other => panic!("{:?} is not supported for ordered tablets", other),
            }
        }
        Ok(())
    }

    fn split_partition(&mut self, _index: usize, _pivot_keys: Vec<RowKey>) -> TabletResult<Vec<PartitionId>> {
        Err(self.unsupported("partition split"))
    }

    fn merge_partitions(&mut self, _first: usize, _last: usize) -> TabletResult<PartitionId> {
        Err(self.unsupported("partition merge"))
    }

    fn update_partition_sample_keys(&mut self, _id: PartitionId, _sample_keys: Vec<RowKey>) -> TabletResult<()> {
        Err(self.unsupported("sample key update"))
    }
}
