//! Tablet cell: the single apply path of one tablet.
//!
//! Requests reach the leader, which validates them, takes prelocks and
//! appends a [`Mutation`] to the log. Mutations are applied strictly in log
//! order. The log stands in for the durable changelog: it survives
//! [`TabletCell::save_load`], which drops every in-memory structure, reloads
//! the last snapshot and replays leader state from the pending mutations.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tablet_common::bg_supervisor::BgActivitySupervisor;
use tablet_common::config::TabletManagerConfig;
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::schema::TableSchema;
use tablet_common::types::{
    TabletId, Timestamp, TransactionGeneration, TransactionSignature, TxnId, FINAL_TRANSACTION_SIGNATURE,
    INITIAL_TRANSACTION_GENERATION,
};
use tablet_common::value::{ColumnId, UnversionedRow, VersionedRow};
use tablet_storage::ordered_dynamic_store::OrderedRow;
use tablet_storage::reader::{lookup_rows, read_ordered_rows, versioned_lookup_row};
use tablet_storage::snapshot::{read_frame, write_frame, TabletImage};
use tablet_storage::{
    OrderedStoreManager, ReplicatedStoreManager, RowKey, SortedStoreManager, Tablet, TabletStoreManager,
    WireCommand,
};

use crate::manager::TransactionManager;
use crate::transaction::SavedTransaction;
use crate::write_manager::{TabletWriteManager, WriteRowsMutation};

pub const CELL_SNAPSHOT_MAGIC: &[u8; 4] = b"TCEL";
pub const CELL_SNAPSHOT_FORMAT_VERSION: u32 = 1;
pub const MIN_CELL_SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One entry of the mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    WriteRows(WriteRowsMutation),
    PrepareTransaction {
        txn_id: TxnId,
        prepare_timestamp: Timestamp,
        persistent: bool,
    },
    CommitTransaction {
        txn_id: TxnId,
        commit_timestamp: Timestamp,
    },
    AbortTransaction {
        txn_id: TxnId,
    },
}

impl Mutation {
    pub fn txn_id(&self) -> TxnId {
        match self {
            Mutation::WriteRows(m) => m.txn_id,
            Mutation::PrepareTransaction { txn_id, .. }
            | Mutation::CommitTransaction { txn_id, .. }
            | Mutation::AbortTransaction { txn_id } => *txn_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Mutation::WriteRows(_) => "write_rows",
            Mutation::PrepareTransaction { .. } => "prepare",
            Mutation::CommitTransaction { .. } => "commit",
            Mutation::AbortTransaction { .. } => "abort",
        }
    }
}

/// Outcome of a logged mutation, filled in when it is applied.
#[derive(Debug, Clone, Default)]
pub struct MutationHandle {
    result: Arc<Mutex<Option<TabletResult<()>>>>,
    done: Arc<AtomicBool>,
}

impl MutationHandle {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// The result, once. `None` while the mutation is still pending.
    pub fn take_result(&self) -> Option<TabletResult<()>> {
        self.result.lock().take()
    }

    fn set(&self, result: TabletResult<()>) {
        *self.result.lock() = Some(result);
        self.done.store(true, Ordering::Release);
    }
}

struct PendingMutation {
    mutation: Mutation,
    handle: MutationHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// Accepts requests and keeps prelocks.
    Leading,
    /// Applies replicated mutations only.
    Following,
    /// Replaying after a restart; nothing transient is touched.
    Recovering,
}

#[derive(Serialize, Deserialize)]
struct CellImage {
    tablet: TabletImage,
    transactions: Vec<SavedTransaction>,
    applied_mutation_count: u64,
}

pub struct TabletCell {
    tablet_id: TabletId,
    write_manager: TabletWriteManager,
    transactions: Arc<TransactionManager>,
    state: CellState,
    pending: VecDeque<PendingMutation>,
    applied_mutation_count: u64,
}

impl TabletCell {
    /// Mounts the tablet of `store_manager` and starts leading.
    pub fn new(mut store_manager: TabletStoreManager) -> TabletResult<Self> {
        store_manager.as_dyn_mut().mount()?;
        let tablet_id = store_manager.tablet().id();
        let transactions = Arc::new(TransactionManager::new(tablet_id));
        tracing::info!(tablet_id = %tablet_id, "tablet cell started");
        Ok(Self {
            tablet_id,
            write_manager: TabletWriteManager::new(store_manager, transactions.clone()),
            transactions,
            state: CellState::Leading,
            pending: VecDeque::new(),
            applied_mutation_count: 0,
        })
    }

    pub fn sorted(tablet_id: TabletId, schema: Arc<TableSchema>, config: Arc<TabletManagerConfig>) -> TabletResult<Self> {
        let tablet = Tablet::new(tablet_id, schema, config);
        Self::new(TabletStoreManager::Sorted(SortedStoreManager::new(
            tablet,
            Arc::new(BgActivitySupervisor::new()),
        )))
    }

    pub fn ordered(tablet_id: TabletId, schema: Arc<TableSchema>, config: Arc<TabletManagerConfig>) -> TabletResult<Self> {
        let tablet = Tablet::new(tablet_id, schema, config);
        Self::new(TabletStoreManager::Ordered(OrderedStoreManager::new(
            tablet,
            Arc::new(BgActivitySupervisor::new()),
        )))
    }

    /// A replicated table whose change log is kept in this tablet.
    pub fn replicated(
        tablet_id: TabletId,
        source_schema: Arc<TableSchema>,
        config: Arc<TabletManagerConfig>,
    ) -> TabletResult<Self> {
        let log_schema = Arc::new(tablet_storage::store_manager::log_schema(&source_schema)?);
        let tablet = Tablet::new(tablet_id, log_schema, config);
        Self::new(TabletStoreManager::Replicated(ReplicatedStoreManager::new(
            source_schema,
            tablet,
            Arc::new(BgActivitySupervisor::new()),
        )))
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    pub fn is_active_leader(&self) -> bool {
        self.state == CellState::Leading
    }

    pub fn tablet(&self) -> &Tablet {
        self.write_manager.tablet()
    }

    pub fn store_manager(&self) -> &TabletStoreManager {
        self.write_manager.store_manager()
    }

    pub fn store_manager_mut(&mut self) -> &mut TabletStoreManager {
        self.write_manager.store_manager_mut()
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn pending_mutation_count(&self) -> usize {
        self.pending.len()
    }

    pub fn applied_mutation_count(&self) -> u64 {
        self.applied_mutation_count
    }

    fn ensure_leader(&self) -> TabletResult<()> {
        if self.is_active_leader() {
            Ok(())
        } else {
            Err(TabletError::NotLeader(format!("{} is {:?}", self.tablet_id, self.state)))
        }
    }

    fn enqueue(&mut self, mutation: Mutation) -> MutationHandle {
        let handle = MutationHandle::default();
        self.pending.push_back(PendingMutation {
            mutation,
            handle: handle.clone(),
        });
        metrics::gauge!("tablet_cell_pending_mutations").set(self.pending.len() as f64);
        handle
    }

    /// Switches between leading and following. A new leader rebuilds its
    /// prelocks from the pending mutations; a follower forgets them.
    pub fn set_leading(&mut self, leading: bool) {
        let target = if leading { CellState::Leading } else { CellState::Following };
        if self.state == target {
            return;
        }
        self.write_manager.drop_transient_state();
        for p in self.pending.iter_mut() {
            if let Mutation::WriteRows(m) = &mut p.mutation {
                m.in_flight = false;
            }
        }
        self.state = target;
        if leading {
            self.reprelock_pending();
        }
        tracing::info!(tablet_id = %self.tablet_id, state = ?target, "cell state changed");
    }

    fn reprelock_pending(&mut self) {
        for p in self.pending.iter_mut() {
            if let Mutation::WriteRows(m) = &mut p.mutation {
                self.write_manager.reprelock(m);
            }
        }
    }

    /// Leader entry point of a write batch. A batch of a superseded
    /// generation is accepted and dropped.
    pub fn write_rows(
        &mut self,
        txn_id: TxnId,
        start_ts: Timestamp,
        commands: Vec<WireCommand>,
        signature: TransactionSignature,
        generation: TransactionGeneration,
    ) -> TabletResult<()> {
        self.ensure_leader()?;
        if let Some(mutation) = self
            .write_manager
            .write_rows(txn_id, start_ts, signature, generation, commands)?
        {
            self.enqueue(Mutation::WriteRows(mutation));
        }
        Ok(())
    }

    /// A complete single-batch write of unversioned rows.
    pub fn write_unversioned_rows(&mut self, txn_id: TxnId, start_ts: Timestamp, rows: Vec<UnversionedRow>) -> TabletResult<()> {
        let commands = rows.into_iter().map(WireCommand::WriteRow).collect();
        self.write_rows(txn_id, start_ts, commands, FINAL_TRANSACTION_SIGNATURE, INITIAL_TRANSACTION_GENERATION)
    }

    /// A complete single-batch write of rows that carry their own timestamps.
    pub fn write_versioned_rows(&mut self, txn_id: TxnId, start_ts: Timestamp, rows: Vec<VersionedRow>) -> TabletResult<()> {
        let commands = rows.into_iter().map(WireCommand::WriteVersionedRow).collect();
        self.write_rows(txn_id, start_ts, commands, FINAL_TRANSACTION_SIGNATURE, INITIAL_TRANSACTION_GENERATION)
    }

    pub fn prepare_transaction_commit(&mut self, txn_id: TxnId, persistent: bool, prepare_ts: Timestamp) -> TabletResult<MutationHandle> {
        self.ensure_leader()?;
        if !persistent {
            self.write_manager.begin_transient_prepare(txn_id, prepare_ts);
        }
        let mutation = Mutation::PrepareTransaction {
            txn_id,
            prepare_timestamp: prepare_ts,
            persistent,
        };
        Ok(self.enqueue(mutation))
    }

    pub fn commit_transaction(&mut self, txn_id: TxnId, commit_ts: Timestamp) -> TabletResult<MutationHandle> {
        self.ensure_leader()?;
        let mutation = Mutation::CommitTransaction {
            txn_id,
            commit_timestamp: commit_ts,
        };
        Ok(self.enqueue(mutation))
    }

    /// Logs a prepare and a commit at `commit_ts`; the handle reports the commit.
    pub fn prepare_and_commit_transaction(&mut self, txn_id: TxnId, persistent: bool, commit_ts: Timestamp) -> TabletResult<MutationHandle> {
        self.prepare_transaction_commit(txn_id, persistent, commit_ts)?;
        self.commit_transaction(txn_id, commit_ts)
    }

    pub fn abort_transaction(&mut self, txn_id: TxnId) -> TabletResult<MutationHandle> {
        self.ensure_leader()?;
        self.write_manager.begin_transient_abort(txn_id);
        Ok(self.enqueue(Mutation::AbortTransaction { txn_id }))
    }

    /// Follower entry point: a mutation the leader already logged.
    pub fn accept_replicated(&mut self, mutation: Mutation) -> TabletResult<()> {
        if self.is_active_leader() {
            return Err(TabletError::internal(
                "REPLICATED_MUTATION_ON_LEADER",
                format!("{} is leading and cannot accept replicated mutations", self.tablet_id),
            ));
        }
        self.enqueue(mutation);
        Ok(())
    }

    fn apply_next(&mut self) -> bool {
        let Some(PendingMutation { mutation, handle }) = self.pending.pop_front() else {
            return false;
        };
        self.applied_mutation_count += 1;
        let kind = mutation.kind();
        let txn_id = mutation.txn_id();
        let consume_prelocks = self.is_active_leader();
        let result = match mutation {
            Mutation::WriteRows(m) => self.write_manager.apply_write_rows(m, consume_prelocks),
            Mutation::PrepareTransaction {
                txn_id,
                prepare_timestamp,
                persistent,
            } => self
                .write_manager
                .prepare_transaction(txn_id, prepare_timestamp, persistent),
            Mutation::CommitTransaction {
                txn_id,
                commit_timestamp,
            } => self.write_manager.commit_transaction(txn_id, commit_timestamp),
            Mutation::AbortTransaction { txn_id } => self.write_manager.abort_transaction(txn_id),
        };
        metrics::counter!("tablet_mutations_applied_total").increment(1);
        metrics::gauge!("tablet_cell_pending_mutations").set(self.pending.len() as f64);
        if let Err(err) = &result {
            metrics::counter!("tablet_mutation_failures_total").increment(1);
            tracing::warn!(
                tablet_id = %self.tablet_id,
                txn_id = %txn_id,
                mutation = kind,
                index = self.applied_mutation_count,
                error = %err,
                "mutation failed"
            );
        }
        handle.set(result);
        true
    }

    /// Applies mutations until `count` of them have been applied in total.
    pub fn apply_up_to(&mut self, count: u64) {
        while self.applied_mutation_count < count && self.apply_next() {}
    }

    pub fn apply_all(&mut self) {
        while self.apply_next() {}
    }

    /// Applies everything pending as a recovering cell would: prelocks are
    /// neither consumed nor released.
    pub fn apply_all_in_recovery(&mut self) {
        let previous = std::mem::replace(&mut self.state, CellState::Recovering);
        self.apply_all();
        self.state = previous;
    }

    /// Serializes the tablet and every persistent transaction.
    pub fn save(&self) -> TabletResult<Vec<u8>> {
        let image = CellImage {
            tablet: TabletImage::save(self.tablet()),
            transactions: self.transactions.save(),
            applied_mutation_count: self.applied_mutation_count,
        };
        Ok(write_frame(
            CELL_SNAPSHOT_MAGIC,
            CELL_SNAPSHOT_FORMAT_VERSION,
            &bincode::serialize(&image)?,
        ))
    }

    /// Replaces the tablet and the transactions with a saved image. Pending
    /// mutations are kept; a leader prelocks them again.
    pub fn load(&mut self, bytes: &[u8]) -> TabletResult<()> {
        let payload = read_frame(
            bytes,
            CELL_SNAPSHOT_MAGIC,
            MIN_CELL_SNAPSHOT_FORMAT_VERSION,
            CELL_SNAPSHOT_FORMAT_VERSION,
        )?;
        let image: CellImage =
            bincode::deserialize(payload).map_err(|e| TabletError::SnapshotCorrupted(e.to_string()))?;
        if image.tablet.tablet_id != self.tablet_id {
            return Err(TabletError::SnapshotCorrupted(format!(
                "snapshot of {} cannot be loaded into {}",
                image.tablet.tablet_id, self.tablet_id
            )));
        }
        let config = self.tablet().config().clone();
        let tablet = image.tablet.restore(config)?;

        let store_manager = self.write_manager.store_manager_mut().as_dyn_mut();
        *store_manager.tablet_mut() = tablet;
        store_manager.mount()?;
        self.transactions.restore(image.transactions);
        self.write_manager.relock_transactions()?;
        self.applied_mutation_count = image.applied_mutation_count;

        for p in self.pending.iter_mut() {
            if let Mutation::WriteRows(m) = &mut p.mutation {
                m.in_flight = false;
            }
        }
        if self.is_active_leader() {
            self.reprelock_pending();
        }
        tracing::info!(
            tablet_id = %self.tablet_id,
            applied = self.applied_mutation_count,
            pending = self.pending.len(),
            "cell loaded from snapshot"
        );
        Ok(())
    }

    /// Simulates a restart: save, drop everything in memory, load.
    pub fn save_load(&mut self) -> TabletResult<()> {
        let bytes = self.save()?;
        let previous = std::mem::replace(&mut self.state, CellState::Recovering);
        let result = self.load(&bytes);
        self.state = previous;
        if self.is_active_leader() {
            self.reprelock_pending();
        }
        result
    }

    /// Writes the snapshot to `path` atomically (temp file + rename).
    pub fn save_to_file(&self, path: &Path) -> TabletResult<()> {
        let bytes = self.save()?;
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        metrics::counter!("tablet_cell_snapshot_saved_total").increment(1);
        tracing::debug!(tablet_id = %self.tablet_id, bytes = bytes.len(), path = %path.display(), "cell snapshot saved");
        Ok(())
    }

    pub fn load_from_file(&mut self, path: &Path) -> TabletResult<()> {
        let bytes = fs::read(path)?;
        self.load(&bytes)
    }

    pub fn has_active_store_locks(&self) -> bool {
        self.write_manager.has_active_store_locks()
    }

    pub fn is_fully_unlocked(&self) -> bool {
        self.write_manager.is_fully_unlocked()
    }

    pub fn lookup_row(&self, key: &RowKey, timestamp: Timestamp) -> TabletResult<Option<UnversionedRow>> {
        let mut rows = lookup_rows(&self.tablet().snapshot(), std::slice::from_ref(key), timestamp, None)?;
        Ok(rows.pop().flatten())
    }

    pub fn versioned_lookup_row(
        &self,
        key: &RowKey,
        timestamp: Timestamp,
        columns: Option<&[ColumnId]>,
    ) -> TabletResult<Option<VersionedRow>> {
        versioned_lookup_row(&self.tablet().snapshot(), key, timestamp, columns)
    }

    pub fn read_ordered_rows(&self, lower: u64, upper: u64) -> TabletResult<Vec<OrderedRow>> {
        read_ordered_rows(&self.tablet().snapshot(), lower, upper)
    }
}
