use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
use parking_lot::Mutex;

use tablet_common::types::{TabletId, Timestamp, TransactionGeneration, TxnId};

use crate::transaction::{SavedTransaction, Transaction, TransactionState};

/// A finished transaction kept for diagnostics.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub txn_id: TxnId,
    pub start_ts: Timestamp,
    pub commit_ts: Option<Timestamp>,
    pub generation: TransactionGeneration,
    pub lifetime_us: u64,
    pub outcome: TransactionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    Aborted(String),
}

#[derive(Debug, Clone, Default)]
pub struct TransactionStatsSnapshot {
    pub active_count: usize,
    pub total_started: u64,
    pub total_committed: u64,
    pub total_aborted: u64,
    pub stale_generation_writes: u64,
    pub signature_mismatches: u64,
}

/// Ring buffer of recently finished transactions.
struct TransactionHistory {
    buf: VecDeque<TransactionRecord>,
    capacity: usize,
}

impl TransactionHistory {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, record: TransactionRecord) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(record);
    }

    fn snapshot(&self) -> Vec<TransactionRecord> {
        self.buf.iter().cloned().collect()
    }
}

struct TransactionStatsCollector {
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    stale_generation_writes: AtomicU64,
    signature_mismatches: AtomicU64,
}

impl TransactionStatsCollector {
    fn new() -> Self {
        Self {
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            stale_generation_writes: AtomicU64::new(0),
            signature_mismatches: AtomicU64::new(0),
        }
    }

    fn snapshot(&self, active_count: usize) -> TransactionStatsSnapshot {
        TransactionStatsSnapshot {
            active_count,
            total_started: self.total_started.load(Ordering::Relaxed),
            total_committed: self.total_committed.load(Ordering::Relaxed),
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            stale_generation_writes: self.stale_generation_writes.load(Ordering::Relaxed),
            signature_mismatches: self.signature_mismatches.load(Ordering::Relaxed),
        }
    }
}

/// Maximum number of finished transactions kept in the history ring buffer.
const TRANSACTION_HISTORY_CAPACITY: usize = 1024;

/// Transactions of one tablet cell, keyed by id.
///
/// Mutation happens on the apply thread only; the map is concurrent so
/// monitoring can inspect it at any time. Never call back into the manager
/// while holding a `Ref`/`RefMut` it returned.
pub struct TransactionManager {
    tablet_id: TabletId,
    transactions: DashMap<TxnId, Transaction>,
    stats: TransactionStatsCollector,
    history: Mutex<TransactionHistory>,
}

impl TransactionManager {
    pub fn new(tablet_id: TabletId) -> Self {
        Self {
            tablet_id,
            transactions: DashMap::new(),
            stats: TransactionStatsCollector::new(),
            history: Mutex::new(TransactionHistory::new(TRANSACTION_HISTORY_CAPACITY)),
        }
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// Leader side: the transaction a write request belongs to.
    pub fn get_or_create_transient(&self, txn_id: TxnId, start_ts: Timestamp) -> RefMut<'_, TxnId, Transaction> {
        self.transactions.entry(txn_id).or_insert_with(|| {
            self.stats.total_started.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(tablet_id = %self.tablet_id, txn_id = %txn_id, start_ts = %start_ts, "transient transaction created");
            Transaction::new(txn_id, start_ts)
        })
    }

    /// Apply side: the transaction a mutation belongs to, now persistent.
    pub fn get_or_create_persistent(&self, txn_id: TxnId, start_ts: Timestamp) -> RefMut<'_, TxnId, Transaction> {
        let mut txn = self.get_or_create_transient(txn_id, start_ts);
        txn.persistent = true;
        txn
    }

    pub fn find(&self, txn_id: TxnId) -> Option<Ref<'_, TxnId, Transaction>> {
        self.transactions.get(&txn_id)
    }

    pub fn find_mut(&self, txn_id: TxnId) -> Option<RefMut<'_, TxnId, Transaction>> {
        self.transactions.get_mut(&txn_id)
    }

    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.transactions.contains_key(&txn_id)
    }

    pub fn transaction_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.transactions.iter().map(|t| *t.key()).collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn any(&self, pred: impl Fn(&Transaction) -> bool) -> bool {
        self.transactions.iter().any(|t| pred(t.value()))
    }

    /// Forgets a transient transaction that never got anything done.
    pub fn remove_if_empty(&self, txn_id: TxnId) {
        let removed = self
            .transactions
            .remove_if(&txn_id, |_, t| !t.persistent && t.holds_no_rows() && t.write_log.is_empty());
        if removed.is_some() {
            tracing::debug!(tablet_id = %self.tablet_id, txn_id = %txn_id, "empty transient transaction dropped");
        }
    }

    /// Removes a finished transaction and records its outcome.
    pub fn finish(&self, txn_id: TxnId, commit_ts: Option<Timestamp>, outcome: TransactionOutcome) -> Option<Transaction> {
        let (_, mut txn) = self.transactions.remove(&txn_id)?;
        txn.state = match outcome {
            TransactionOutcome::Committed => TransactionState::Committed,
            TransactionOutcome::Aborted(_) => TransactionState::Aborted,
        };
        let lifetime_us = txn.started_at.elapsed().as_micros() as u64;
        match &outcome {
            TransactionOutcome::Committed => {
                self.stats.total_committed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("tablet_txn_committed_total").increment(1);
                tracing::debug!(tablet_id = %self.tablet_id, txn_id = %txn_id, lifetime_us, "transaction committed");
            }
            TransactionOutcome::Aborted(reason) => {
                self.stats.total_aborted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("tablet_txn_aborted_total").increment(1);
                tracing::debug!(tablet_id = %self.tablet_id, txn_id = %txn_id, reason = %reason, "transaction aborted");
            }
        }
        self.history.lock().push(TransactionRecord {
            txn_id,
            start_ts: txn.start_timestamp,
            commit_ts,
            generation: txn.persistent_generation,
            lifetime_us,
            outcome,
        });
        Some(txn)
    }

    pub(crate) fn record_stale_generation(&self) {
        self.stats.stale_generation_writes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tablet_stale_generation_writes_total").increment(1);
    }

    pub(crate) fn record_signature_mismatch(&self) {
        self.stats.signature_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Persistent transactions, ordered by id.
    pub fn save(&self) -> Vec<SavedTransaction> {
        let mut saved: Vec<SavedTransaction> = self
            .transactions
            .iter()
            .filter(|t| t.persistent && !t.state.is_finished())
            .map(|t| t.save())
            .collect();
        saved.sort_by_key(|t| t.id);
        saved
    }

    /// Replaces every transaction with the saved ones. Row references are
    /// not restored; the write manager relocks them from the write logs.
    pub fn restore(&self, saved: Vec<SavedTransaction>) {
        self.transactions.clear();
        for s in saved {
            self.transactions.insert(s.id, Transaction::restore(s));
        }
        tracing::info!(tablet_id = %self.tablet_id, count = self.transactions.len(), "transactions restored");
    }

    pub fn stats_snapshot(&self) -> TransactionStatsSnapshot {
        self.stats.snapshot(self.transactions.len())
    }

    pub fn history_snapshot(&self) -> Vec<TransactionRecord> {
        self.history.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_then_persistent() {
        let manager = TransactionManager::new(TabletId(1));
        {
            let txn = manager.get_or_create_transient(TxnId(5), Timestamp(10));
            assert!(!txn.is_persistent());
        }
        {
            let txn = manager.get_or_create_persistent(TxnId(5), Timestamp(99));
            assert!(txn.is_persistent());
            assert_eq!(txn.start_timestamp(), Timestamp(10));
        }
        assert_eq!(manager.stats_snapshot().total_started, 1);
        assert_eq!(manager.save().len(), 1);
    }

    #[test]
    fn test_remove_if_empty_keeps_persistent() {
        let manager = TransactionManager::new(TabletId(1));
        drop(manager.get_or_create_transient(TxnId(1), Timestamp(1)));
        drop(manager.get_or_create_persistent(TxnId(2), Timestamp(1)));
        manager.remove_if_empty(TxnId(1));
        manager.remove_if_empty(TxnId(2));
        assert!(!manager.contains(TxnId(1)));
        assert!(manager.contains(TxnId(2)));
    }

    #[test]
    fn test_finish_records_history() {
        let manager = TransactionManager::new(TabletId(1));
        drop(manager.get_or_create_persistent(TxnId(1), Timestamp(1)));
        drop(manager.get_or_create_persistent(TxnId(2), Timestamp(2)));
        let txn = manager.finish(TxnId(1), Some(Timestamp(5)), TransactionOutcome::Committed).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        manager.finish(TxnId(2), None, TransactionOutcome::Aborted("by request".into()));
        assert!(manager.finish(TxnId(3), None, TransactionOutcome::Committed).is_none());

        let history = manager.history_snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].commit_ts, Some(Timestamp(5)));
        assert_eq!(history[1].outcome, TransactionOutcome::Aborted("by request".into()));
        let stats = manager.stats_snapshot();
        assert_eq!((stats.total_committed, stats.total_aborted, stats.active_count), (1, 1, 0));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = TransactionHistory::new(2);
        for i in 0..3 {
            history.push(TransactionRecord {
                txn_id: TxnId(i),
                start_ts: Timestamp(1),
                commit_ts: None,
                generation: 0,
                lifetime_us: 0,
                outcome: TransactionOutcome::Committed,
            });
        }
        let ids: Vec<u64> = history.snapshot().iter().map(|r| r.txn_id.0).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
