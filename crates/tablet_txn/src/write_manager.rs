//! Tablet write manager: turns write batches into row locks and commits.
//!
//! A batch goes through two sides:
//!
//! ```text
//!  leader:  write_rows ──barrier check──▶ prelock rows ──▶ WriteRowsMutation (log)
//!  apply:   apply_write_rows ──▶ lock + stage values, grow signature, write log
//!           prepare_transaction / commit_transaction / abort_transaction
//! ```
//!
//! Retries of a batch carry a higher generation. A newer generation makes
//! the older one void: on the leader its prelocks are released, on apply its
//! staged values are aborted and the write log restarts. Writes of an older
//! generation than the one already seen are dropped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tablet_common::error::{TabletError, TabletResult, WriteBarrierReason};
use tablet_common::types::{
    TabletId, Timestamp, TransactionGeneration, TransactionSignature, TxnId, FINAL_TRANSACTION_SIGNATURE,
    INITIAL_TRANSACTION_SIGNATURE,
};
use tablet_common::value::VersionedRow;
use tablet_storage::{Tablet, TabletStoreManager, WireCommand, WriteContext};

use crate::manager::{TransactionManager, TransactionOutcome};
use crate::transaction::{PrelockedRow, Transaction, TransactionState, WriteLogEntry};

/// One write batch as it travels through the mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRowsMutation {
    pub txn_id: TxnId,
    pub start_timestamp: Timestamp,
    pub signature: TransactionSignature,
    pub generation: TransactionGeneration,
    pub versioned: bool,
    pub commands: Vec<WireCommand>,
    /// Counted in the leader's in-flight totals until applied.
    #[serde(skip)]
    pub(crate) in_flight: bool,
}

impl WriteRowsMutation {
    pub fn new(
        txn_id: TxnId,
        start_timestamp: Timestamp,
        signature: TransactionSignature,
        generation: TransactionGeneration,
        commands: Vec<WireCommand>,
    ) -> TabletResult<Self> {
        Ok(Self {
            txn_id,
            start_timestamp,
            signature,
            generation,
            versioned: batch_is_versioned(&commands)?,
            commands,
            in_flight: false,
        })
    }
}

fn batch_is_versioned(commands: &[WireCommand]) -> TabletResult<bool> {
    let versioned = commands.iter().filter(|c| c.is_versioned()).count();
    if versioned != 0 && versioned != commands.len() {
        return Err(TabletError::Unsupported(
            "a batch cannot mix versioned and unversioned rows".into(),
        ));
    }
    Ok(versioned != 0)
}

pub struct TabletWriteManager {
    tablet_id: TabletId,
    store_manager: TabletStoreManager,
    transactions: Arc<TransactionManager>,
    in_flight_user_mutations: usize,
    in_flight_replicator_mutations: usize,
}

impl TabletWriteManager {
    pub fn new(store_manager: TabletStoreManager, transactions: Arc<TransactionManager>) -> Self {
        Self {
            tablet_id: store_manager.tablet().id(),
            store_manager,
            transactions,
            in_flight_user_mutations: 0,
            in_flight_replicator_mutations: 0,
        }
    }

    pub fn store_manager(&self) -> &TabletStoreManager {
        &self.store_manager
    }

    pub fn store_manager_mut(&mut self) -> &mut TabletStoreManager {
        &mut self.store_manager
    }

    pub fn tablet(&self) -> &Tablet {
        self.store_manager.tablet()
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn in_flight_mutation_count(&self) -> usize {
        self.in_flight_user_mutations + self.in_flight_replicator_mutations
    }

    fn check_write_barrier(&self, versioned: bool) -> TabletResult<()> {
        let reason = if versioned {
            if self.transactions.any(|t| t.is_persistent() && t.has_unversioned_writes()) {
                Some(WriteBarrierReason::UserWritesPending)
            } else if self.in_flight_user_mutations > 0 {
                Some(WriteBarrierReason::UserMutationsInFlight)
            } else {
                None
            }
        } else if self.in_flight_replicator_mutations > 0 || self.transactions.any(Transaction::has_versioned_writes) {
            Some(WriteBarrierReason::ReplicatorWritesPending)
        } else {
            None
        };
        match reason {
            Some(reason) => {
                metrics::counter!("tablet_write_barrier_rejections_total").increment(1);
                tracing::debug!(tablet_id = %self.tablet_id, %reason, "write rejected by barrier");
                Err(TabletError::WriteBarrier {
                    tablet_id: self.tablet_id,
                    reason,
                })
            }
            None => Ok(()),
        }
    }

    /// Leader side of a write. Returns the mutation to append to the log, or
    /// `None` when the batch belongs to a generation already superseded.
    pub fn write_rows(
        &mut self,
        txn_id: TxnId,
        start_timestamp: Timestamp,
        signature: TransactionSignature,
        generation: TransactionGeneration,
        commands: Vec<WireCommand>,
    ) -> TabletResult<Option<WriteRowsMutation>> {
        let mut mutation = WriteRowsMutation::new(txn_id, start_timestamp, signature, generation, commands)?;
        if mutation.versioned && self.store_manager.writes_at_commit() {
            return Err(TabletError::Unsupported(format!(
                "versioned writes to non-sorted {}",
                self.tablet_id
            )));
        }
        self.check_write_barrier(mutation.versioned)?;
        if let Some(txn) = self.transactions.find(txn_id) {
            if txn.state() != TransactionState::Active {
                return Err(TabletError::InvalidTransactionState {
                    txn_id,
                    state: txn.state().to_string(),
                    operation: "write",
                });
            }
        }
        if self.prelock(&mut mutation)? {
            Ok(Some(mutation))
        } else {
            Ok(None)
        }
    }

    /// Takes the leader's locks for `mutation` and counts it as in flight.
    /// Returns false for a superseded generation.
    fn prelock(&mut self, mutation: &mut WriteRowsMutation) -> TabletResult<bool> {
        let txn_id = mutation.txn_id;
        let generation = mutation.generation;
        let created = !self.transactions.contains(txn_id);
        let mut txn_ref = self.transactions.get_or_create_transient(txn_id, mutation.start_timestamp);
        let txn = &mut *txn_ref;

        if generation < txn.transient_generation {
            tracing::debug!(
                tablet_id = %self.tablet_id,
                txn_id = %txn_id,
                generation,
                transient_generation = txn.transient_generation,
                "stale write generation dropped"
            );
            drop(txn_ref);
            self.transactions.record_stale_generation();
            return Ok(false);
        }

        let sorted = self.store_manager.as_sorted_mut();
        if generation > txn.transient_generation {
            let (stale, current): (Vec<PrelockedRow>, Vec<PrelockedRow>) =
                txn.prelocked_rows.drain(..).partition(|p| p.generation < generation);
            if let Some(m) = sorted.as_deref() {
                for p in &stale {
                    let still_needed = txn
                        .locked_rows
                        .iter()
                        .chain(current.iter().map(|c| &c.row))
                        .any(|r| r.same_row(&p.row));
                    if !still_needed {
                        m.release_row(&p.row, txn_id);
                    }
                }
            }
            txn.prelocked_rows = current.into();
            tracing::debug!(
                tablet_id = %self.tablet_id,
                txn_id = %txn_id,
                from = txn.transient_generation,
                to = generation,
                released = stale.len(),
                "transient generation advanced"
            );
            txn.transient_generation = generation;
        }

        if let (Some(m), false) = (sorted, mutation.versioned) {
            let start_ts = txn.start_timestamp;
            let checked = mutation.commands.iter().try_for_each(|c| m.check_row(txn_id, start_ts, c));
            if let Err(err) = checked {
                drop(txn_ref);
                if created {
                    self.transactions.remove_if_empty(txn_id);
                }
                return Err(err);
            }
            for command in &mutation.commands {
                let row = m.prelock_row(txn_id, start_ts, command)?;
                txn.prelocked_rows.push_back(PrelockedRow {
                    generation,
                    command: command.clone(),
                    row,
                });
            }
        }
        drop(txn_ref);

        mutation.in_flight = true;
        if mutation.versioned {
            self.in_flight_replicator_mutations += 1;
        } else {
            self.in_flight_user_mutations += 1;
        }
        Ok(true)
    }

    fn finish_in_flight(&mut self, mutation: &WriteRowsMutation) {
        if !mutation.in_flight {
            return;
        }
        let counter = if mutation.versioned {
            &mut self.in_flight_replicator_mutations
        } else {
            &mut self.in_flight_user_mutations
        };
        *counter = counter.saturating_sub(1);
    }

    /// Apply side of a write. With `consume_prelocks` the leader's prelocks
    /// for the applied rows are handed over to the locked set; recovery and
    /// followers leave them alone.
    pub fn apply_write_rows(&mut self, mutation: WriteRowsMutation, consume_prelocks: bool) -> TabletResult<()> {
        self.finish_in_flight(&mutation);
        let WriteRowsMutation {
            txn_id,
            start_timestamp,
            signature,
            generation,
            versioned,
            commands,
            ..
        } = mutation;

        // A conflict must leave no row locked or staged.
        let known = self
            .transactions
            .find(txn_id)
            .map(|t| (t.start_timestamp, t.persistent_generation));
        let stale = known.is_some_and(|(_, g)| generation < g);
        if let (Some(m), false, false) = (self.store_manager.as_sorted(), versioned, stale) {
            let start_ts = known.map_or(start_timestamp, |(ts, _)| ts);
            commands.iter().try_for_each(|c| m.check_row(txn_id, start_ts, c))?;
        }

        let mut txn_ref = self.transactions.get_or_create_persistent(txn_id, start_timestamp);
        let txn = &mut *txn_ref;
        if txn.state.persistent() != TransactionState::Active {
            return Err(TabletError::InvalidTransactionState {
                txn_id,
                state: txn.state.to_string(),
                operation: "write",
            });
        }
        if generation < txn.persistent_generation {
            tracing::debug!(
                tablet_id = %self.tablet_id,
                txn_id = %txn_id,
                generation,
                persistent_generation = txn.persistent_generation,
                "stale write generation skipped on apply"
            );
            drop(txn_ref);
            self.transactions.record_stale_generation();
            return Ok(());
        }

        let mut sorted = self.store_manager.as_sorted_mut();
        if generation > txn.persistent_generation {
            if let Some(m) = sorted.as_deref_mut() {
                for row in txn.locked_rows.drain(..) {
                    m.abort_row(&row, txn_id);
                }
                let tablet_id = self.tablet_id;
                let start_ts = txn.start_timestamp;
                txn.prelocked_rows.retain_mut(|p| {
                    if p.generation < generation {
                        return false;
                    }
                    match m.prelock_row(txn_id, start_ts, &p.command) {
                        Ok(row) => {
                            p.row = row;
                            true
                        }
                        Err(err) => {
                            tracing::warn!(
                                tablet_id = %tablet_id,
                                txn_id = %txn_id,
                                error = %err,
                                "prelock lost after generation change"
                            );
                            false
                        }
                    }
                });
            }
            tracing::info!(
                tablet_id = %self.tablet_id,
                txn_id = %txn_id,
                from = txn.persistent_generation,
                to = generation,
                "persistent generation advanced, previous writes discarded"
            );
            txn.write_log.clear();
            txn.persistent_signature = INITIAL_TRANSACTION_SIGNATURE;
            txn.persistent_generation = generation;
            txn.transient_generation = txn.transient_generation.max(generation);
        }

        if let (Some(m), false) = (sorted, versioned) {
            for command in &commands {
                let row = m.lock_row(txn_id, txn.start_timestamp, command)?;
                if consume_prelocks {
                    txn.take_prelock(generation, &row);
                }
                txn.add_locked_row(row);
            }
        }
        txn.write_log.push(WriteLogEntry {
            generation,
            signature,
            commands,
        });
        txn.persistent_signature = txn.persistent_signature.wrapping_add(signature);
        tracing::debug!(
            tablet_id = %self.tablet_id,
            txn_id = %txn_id,
            generation,
            signature = format_args!("{:#x}", txn.persistent_signature),
            "write batch applied"
        );
        Ok(())
    }

    fn signature_error(txn: &Transaction) -> Option<TabletError> {
        (txn.persistent_signature != FINAL_TRANSACTION_SIGNATURE).then(|| TabletError::SignatureMismatch {
            txn_id: txn.id,
            expected: FINAL_TRANSACTION_SIGNATURE,
            actual: txn.persistent_signature,
        })
    }

    /// Leader side of a transient prepare.
    pub fn begin_transient_prepare(&self, txn_id: TxnId, prepare_ts: Timestamp) {
        if let Some(mut txn) = self.transactions.find_mut(txn_id) {
            if txn.state == TransactionState::Active {
                txn.state = TransactionState::TransientCommitPrepared;
                txn.prepare_timestamp = prepare_ts;
            }
        }
    }

    /// Leader side of an abort: no more writes are accepted for the transaction.
    pub fn begin_transient_abort(&self, txn_id: TxnId) {
        if let Some(mut txn) = self.transactions.find_mut(txn_id) {
            if !txn.state.is_commit_prepared() {
                txn.state = TransactionState::TransientAbortPrepared;
            }
        }
    }

    /// A transaction unknown to the tablet wrote nothing here; preparing it
    /// is a no-op.
    pub fn prepare_transaction(&mut self, txn_id: TxnId, prepare_ts: Timestamp, persistent: bool) -> TabletResult<()> {
        let Some(mut txn_ref) = self.transactions.find_mut(txn_id) else {
            tracing::debug!(tablet_id = %self.tablet_id, txn_id = %txn_id, "prepare of unknown transaction ignored");
            return Ok(());
        };
        let txn = &mut *txn_ref;
        match txn.state {
            TransactionState::Active | TransactionState::TransientCommitPrepared => {}
            TransactionState::PersistentCommitPrepared => return Ok(()),
            state => {
                return Err(TabletError::InvalidTransactionState {
                    txn_id,
                    state: state.to_string(),
                    operation: "prepare",
                })
            }
        }
        if let Some(err) = Self::signature_error(txn) {
            drop(txn_ref);
            self.transactions.record_signature_mismatch();
            return Err(err);
        }
        if let Some(m) = self.store_manager.as_sorted() {
            for row in &txn.locked_rows {
                m.prepare_row(row, txn_id, prepare_ts);
            }
        }
        txn.prepare_timestamp = prepare_ts;
        txn.state = if persistent {
            TransactionState::PersistentCommitPrepared
        } else {
            TransactionState::TransientCommitPrepared
        };
        Ok(())
    }

    /// Commits everything the transaction wrote. An incomplete signature
    /// aborts the transaction instead.
    pub fn commit_transaction(&mut self, txn_id: TxnId, commit_ts: Timestamp) -> TabletResult<()> {
        let Some(mut txn_ref) = self.transactions.find_mut(txn_id) else {
            tracing::debug!(tablet_id = %self.tablet_id, txn_id = %txn_id, "commit of unknown transaction ignored");
            return Ok(());
        };
        if txn_ref.state == TransactionState::TransientAbortPrepared {
            return Err(TabletError::InvalidTransactionState {
                txn_id,
                state: txn_ref.state.to_string(),
                operation: "commit",
            });
        }
        if let Some(err) = Self::signature_error(&txn_ref) {
            drop(txn_ref);
            self.transactions.record_signature_mismatch();
            tracing::warn!(tablet_id = %self.tablet_id, txn_id = %txn_id, error = %err, "commit refused");
            self.abort_transaction_with(txn_id, err.to_string());
            return Err(err);
        }

        let result = commit_rows(&mut self.store_manager, &mut txn_ref, commit_ts);
        drop(txn_ref);
        match result {
            Ok(()) => {
                self.transactions.finish(txn_id, Some(commit_ts), TransactionOutcome::Committed);
                Ok(())
            }
            Err(err) => {
                tracing::error!(tablet_id = %self.tablet_id, txn_id = %txn_id, error = %err, "commit failed");
                self.abort_transaction_with(txn_id, err.to_string());
                Err(err)
            }
        }
    }

    pub fn abort_transaction(&mut self, txn_id: TxnId) -> TabletResult<()> {
        if let Some(txn) = self.transactions.find(txn_id) {
            if txn.state == TransactionState::PersistentCommitPrepared {
                return Err(TabletError::InvalidTransactionState {
                    txn_id,
                    state: txn.state.to_string(),
                    operation: "abort",
                });
            }
        }
        self.abort_transaction_with(txn_id, "aborted by request".into());
        Ok(())
    }

    fn abort_transaction_with(&mut self, txn_id: TxnId, reason: String) {
        if let Some(mut txn_ref) = self.transactions.find_mut(txn_id) {
            release_rows(&self.store_manager, &mut txn_ref, true);
        }
        self.transactions.finish(txn_id, None, TransactionOutcome::Aborted(reason));
    }

    /// Relocks the rows of every restored transaction from its write log.
    pub fn relock_transactions(&mut self) -> TabletResult<()> {
        self.in_flight_user_mutations = 0;
        self.in_flight_replicator_mutations = 0;
        let Some(m) = self.store_manager.as_sorted_mut() else {
            return Ok(());
        };
        let mut relocked = 0usize;
        for txn_id in self.transactions.transaction_ids() {
            let Some(mut txn_ref) = self.transactions.find_mut(txn_id) else {
                continue;
            };
            let txn = &mut *txn_ref;
            for entry in txn.write_log.iter().filter(|e| !e.is_versioned()) {
                for command in &entry.commands {
                    let row = m.lock_row(txn_id, txn.start_timestamp, command)?;
                    if !txn.locked_rows.iter().any(|r| r.same_row(&row)) {
                        txn.locked_rows.push(row);
                    }
                }
            }
            if txn.state == TransactionState::PersistentCommitPrepared {
                for row in &txn.locked_rows {
                    m.prepare_row(row, txn_id, txn.prepare_timestamp);
                }
            }
            relocked += txn.locked_rows.len();
        }
        tracing::info!(tablet_id = %self.tablet_id, rows = relocked, "rows relocked from write logs");
        Ok(())
    }

    /// Leader side of a pending mutation after a reload or a leader switch.
    /// Barriers are not checked: the mutation is already in the log.
    pub fn reprelock(&mut self, mutation: &mut WriteRowsMutation) {
        mutation.in_flight = false;
        if let Err(err) = self.prelock(mutation) {
            tracing::warn!(
                tablet_id = %self.tablet_id,
                txn_id = %mutation.txn_id,
                error = %err,
                "pending write could not be prelocked"
            );
        }
    }

    /// Drops everything only the leader knows: prelocks and in-flight counts.
    pub fn drop_transient_state(&mut self) {
        for txn_id in self.transactions.transaction_ids() {
            if let Some(mut txn_ref) = self.transactions.find_mut(txn_id) {
                release_rows(&self.store_manager, &mut txn_ref, false);
                txn_ref.transient_generation = txn_ref.persistent_generation;
                txn_ref.state = txn_ref.state.persistent();
            }
            self.transactions.remove_if_empty(txn_id);
        }
        self.in_flight_user_mutations = 0;
        self.in_flight_replicator_mutations = 0;
    }

    pub fn has_active_store_locks(&self) -> bool {
        self.store_manager.as_dyn().has_active_locks()
    }

    /// No store holds a lock or staged value and no transaction holds a row.
    pub fn is_fully_unlocked(&self) -> bool {
        let stores_clean = self
            .tablet()
            .stores()
            .filter_map(|s| s.as_sorted_dynamic())
            .all(|s| s.lock_count() == 0 && s.locked_rows().is_empty());
        stores_clean && !self.transactions.any(|t| !t.holds_no_rows())
    }
}

fn commit_rows(store_manager: &mut TabletStoreManager, txn: &mut Transaction, commit_ts: Timestamp) -> TabletResult<()> {
    let txn_id = txn.id;
    if store_manager.writes_at_commit() {
        let commands: Vec<WireCommand> = txn.write_log.iter().flat_map(|e| e.commands.iter().cloned()).collect();
        let mut ctx = WriteContext::at_commit(txn_id, txn.start_timestamp, commit_ts);
        return store_manager.as_dyn_mut().execute_writes(&commands, &mut ctx);
    }
    if let Some(m) = store_manager.as_sorted_mut() {
        m.check_versioned_rows(versioned_rows(&txn.write_log))?;
        for row in txn.locked_rows.drain(..) {
            m.commit_row(&row, txn_id, commit_ts)?;
        }
        for p in txn.prelocked_rows.drain(..) {
            m.release_row(&p.row, txn_id);
        }
        for row in versioned_rows(&txn.write_log) {
            m.write_versioned_row(row)?;
        }
    }
    Ok(())
}

fn versioned_rows(write_log: &[WriteLogEntry]) -> impl Iterator<Item = &VersionedRow> {
    write_log
        .iter()
        .filter(|e| e.is_versioned())
        .flat_map(|e| e.commands.iter())
        .filter_map(|c| match c {
            WireCommand::WriteVersionedRow(row) => Some(row),
            _ => None,
        })
}

/// Frees the rows of `txn`. With `abort_locked` staged values are dropped as
/// well; otherwise only prelocks are released.
fn release_rows(store_manager: &TabletStoreManager, txn: &mut Transaction, abort_locked: bool) {
    let Some(m) = store_manager.as_sorted() else {
        return;
    };
    let txn_id = txn.id;
    for p in txn.prelocked_rows.drain(..) {
        if !txn.locked_rows.iter().any(|r| r.same_row(&p.row)) {
            m.release_row(&p.row, txn_id);
        }
    }
    if abort_locked {
        for row in txn.locked_rows.drain(..) {
            m.abort_row(&row, txn_id);
        }
    }
}
