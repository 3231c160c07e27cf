use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use tablet_common::types::{
    Timestamp, TransactionGeneration, TransactionSignature, TxnId, INITIAL_TRANSACTION_GENERATION,
    INITIAL_TRANSACTION_SIGNATURE,
};
use tablet_storage::{DynamicRowRef, WireCommand};

/// Transaction state as seen by one tablet.
///
/// Transient states exist only on the leader and are never saved; a saved
/// transaction comes back in the persistent state that preceded them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Active,
    TransientCommitPrepared,
    PersistentCommitPrepared,
    Committed,
    TransientAbortPrepared,
    Aborted,
}

impl TransactionState {
    pub fn is_finished(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }

    pub fn is_commit_prepared(self) -> bool {
        matches!(
            self,
            TransactionState::TransientCommitPrepared | TransactionState::PersistentCommitPrepared
        )
    }

    /// The state that survives a snapshot.
    pub fn persistent(self) -> TransactionState {
        match self {
            TransactionState::TransientCommitPrepared | TransactionState::TransientAbortPrepared => {
                TransactionState::Active
            }
            other => other,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::TransientCommitPrepared => "transient commit prepared",
            TransactionState::PersistentCommitPrepared => "persistent commit prepared",
            TransactionState::Committed => "committed",
            TransactionState::TransientAbortPrepared => "transient abort prepared",
            TransactionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One applied write batch of the current persistent generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteLogEntry {
    pub generation: TransactionGeneration,
    pub signature: TransactionSignature,
    pub commands: Vec<WireCommand>,
}

impl WriteLogEntry {
    pub fn is_versioned(&self) -> bool {
        self.commands.iter().any(WireCommand::is_versioned)
    }
}

/// A row the leader locked before the batch reached the apply path.
#[derive(Debug, Clone)]
pub struct PrelockedRow {
    pub generation: TransactionGeneration,
    pub command: WireCommand,
    pub row: DynamicRowRef,
}

/// A transaction touching one tablet.
///
/// The persistent half (state, signature, generation, write log) is driven
/// by the apply path and saved with the cell. The transient half
/// (transient generation, prelocked rows) belongs to the leader and is
/// rebuilt from the pending mutations after a reload.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: TxnId,
    pub(crate) start_timestamp: Timestamp,
    pub(crate) state: TransactionState,
    pub(crate) prepare_timestamp: Timestamp,
    /// Set once the apply path has seen the transaction.
    pub(crate) persistent: bool,
    pub(crate) persistent_signature: TransactionSignature,
    pub(crate) persistent_generation: TransactionGeneration,
    pub(crate) transient_generation: TransactionGeneration,
    pub(crate) prelocked_rows: VecDeque<PrelockedRow>,
    pub(crate) locked_rows: Vec<DynamicRowRef>,
    pub(crate) write_log: Vec<WriteLogEntry>,
    pub(crate) started_at: Instant,
}

impl Transaction {
    pub fn new(id: TxnId, start_timestamp: Timestamp) -> Self {
        Self {
            id,
            start_timestamp,
            state: TransactionState::Active,
            prepare_timestamp: Timestamp::NULL,
            persistent: false,
            persistent_signature: INITIAL_TRANSACTION_SIGNATURE,
            persistent_generation: INITIAL_TRANSACTION_GENERATION,
            transient_generation: INITIAL_TRANSACTION_GENERATION,
            prelocked_rows: VecDeque::new(),
            locked_rows: Vec::new(),
            write_log: Vec::new(),
            started_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.start_timestamp
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn prepare_timestamp(&self) -> Timestamp {
        self.prepare_timestamp
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn persistent_signature(&self) -> TransactionSignature {
        self.persistent_signature
    }

    pub fn persistent_generation(&self) -> TransactionGeneration {
        self.persistent_generation
    }

    pub fn transient_generation(&self) -> TransactionGeneration {
        self.transient_generation
    }

    pub fn prelocked_row_count(&self) -> usize {
        self.prelocked_rows.len()
    }

    pub fn locked_row_count(&self) -> usize {
        self.locked_rows.len()
    }

    pub fn write_log(&self) -> &[WriteLogEntry] {
        &self.write_log
    }

    pub fn has_unversioned_writes(&self) -> bool {
        self.write_log.iter().any(|e| !e.is_versioned())
    }

    pub fn has_versioned_writes(&self) -> bool {
        self.write_log.iter().any(WriteLogEntry::is_versioned)
    }

    /// True when no row of any store still references this transaction.
    pub fn holds_no_rows(&self) -> bool {
        self.prelocked_rows.is_empty() && self.locked_rows.is_empty()
    }

    pub(crate) fn add_locked_row(&mut self, row: DynamicRowRef) {
        if !self.locked_rows.iter().any(|r| r.same_row(&row)) {
            self.locked_rows.push(row);
        }
    }

    /// Drops the prelock `row` got for `generation`, if any.
    pub(crate) fn take_prelock(&mut self, generation: TransactionGeneration, row: &DynamicRowRef) -> bool {
        match self
            .prelocked_rows
            .iter()
            .position(|p| p.generation == generation && p.row.same_row(row))
        {
            Some(pos) => {
                self.prelocked_rows.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn save(&self) -> SavedTransaction {
        SavedTransaction {
            id: self.id,
            start_timestamp: self.start_timestamp,
            state: self.state.persistent(),
            prepare_timestamp: self.prepare_timestamp,
            signature: self.persistent_signature,
            generation: self.persistent_generation,
            write_log: self.write_log.clone(),
        }
    }

    pub(crate) fn restore(saved: SavedTransaction) -> Self {
        Self {
            state: saved.state,
            prepare_timestamp: saved.prepare_timestamp,
            persistent: true,
            persistent_signature: saved.signature,
            persistent_generation: saved.generation,
            transient_generation: saved.generation,
            write_log: saved.write_log,
            ..Self::new(saved.id, saved.start_timestamp)
        }
    }
}

/// Persistent half of a transaction as written to a cell snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTransaction {
    pub id: TxnId,
    pub start_timestamp: Timestamp,
    pub state: TransactionState,
    pub prepare_timestamp: Timestamp,
    pub signature: TransactionSignature,
    pub generation: TransactionGeneration,
    pub write_log: Vec<WriteLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::value::{UnversionedRow, Value, VersionedRow, VersionedValue};

    fn entry(versioned: bool) -> WriteLogEntry {
        let command = if versioned {
            WireCommand::WriteVersionedRow(VersionedRow::from_values(
                vec![Value::Int64(1)],
                vec![VersionedValue::new(1, 1i64, Timestamp(5))],
            ))
        } else {
            WireCommand::WriteRow(UnversionedRow::from_values(vec![Value::Int64(1), Value::Int64(1)]))
        };
        WriteLogEntry {
            generation: 0,
            signature: 1,
            commands: vec![command],
        }
    }

    #[test]
    fn test_transient_states_are_not_saved() {
        assert_eq!(TransactionState::TransientCommitPrepared.persistent(), TransactionState::Active);
        assert_eq!(TransactionState::TransientAbortPrepared.persistent(), TransactionState::Active);
        assert_eq!(
            TransactionState::PersistentCommitPrepared.persistent(),
            TransactionState::PersistentCommitPrepared
        );

        let mut txn = Transaction::new(TxnId(3), Timestamp(10));
        txn.state = TransactionState::TransientCommitPrepared;
        txn.persistent_generation = 2;
        txn.transient_generation = 4;
        txn.write_log.push(entry(false));
        let restored = Transaction::restore(txn.save());
        assert_eq!(restored.state(), TransactionState::Active);
        assert_eq!(restored.transient_generation(), 2);
        assert!(restored.is_persistent());
        assert!(restored.has_unversioned_writes());
        assert!(!restored.has_versioned_writes());
    }

    #[test]
    fn test_write_kinds() {
        let mut txn = Transaction::new(TxnId(1), Timestamp(1));
        assert!(!txn.has_versioned_writes());
        txn.write_log.push(entry(true));
        assert!(txn.has_versioned_writes());
        assert!(!txn.has_unversioned_writes());
        assert_eq!(TransactionState::PersistentCommitPrepared.to_string(), "persistent commit prepared");
    }
}
