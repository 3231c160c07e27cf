use std::fmt;

use thiserror::Error;

use crate::types::{StoreId, TabletId, Timestamp, TransactionSignature, TxnId};

/// Convenience alias for `Result<T, TabletError>`.
pub type TabletResult<T> = Result<T, TabletError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`:   malformed request, unknown transaction, wrong state
/// - `Retryable`:   lock conflict; the caller SHOULD retry the whole transaction
/// - `Transient`:   fan-in exhaustion, backoff, not leading; caller MAY retry later
/// - `InternalBug`: sequencing violation or corrupted state; alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Why a write was refused by the tablet write barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBarrierReason {
    /// Applied unversioned writes belong to transactions not yet finished.
    UserWritesPending,
    /// Unversioned writes were accepted by the leader but are not applied yet.
    UserMutationsInFlight,
    /// Replicated (versioned) writes are not finished yet.
    ReplicatorWritesPending,
}

impl fmt::Display for WriteBarrierReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteBarrierReason::UserWritesPending => write!(f, "user writes are still pending"),
            WriteBarrierReason::UserMutationsInFlight => {
                write!(f, "user mutations are still in flight")
            }
            WriteBarrierReason::ReplicatorWritesPending => {
                write!(f, "replicator writes are still pending")
            }
        }
    }
}

/// Who holds the lock a writer collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockConflictWinner {
    /// Another transaction owns the lock right now.
    Transaction(TxnId),
    /// The lock is free but was committed after the writer started.
    CommittedAt(Timestamp),
}

impl fmt::Display for LockConflictWinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockConflictWinner::Transaction(txn) => write!(f, "held by {}", txn),
            LockConflictWinner::CommittedAt(ts) => write!(f, "committed at {}", ts),
        }
    }
}

/// Every error the tablet engine surfaces to its callers.
#[derive(Error, Debug)]
pub enum TabletError {
    #[error("Row lock conflict due to concurrent write: {txn_id} on key {key}, lock group {lock_index} {winner}")]
    LockConflict {
        txn_id: TxnId,
        key: String,
        lock_index: usize,
        winner: LockConflictWinner,
    },

    #[error("Tablet {tablet_id} is not ready for this write: {reason}")]
    WriteBarrier {
        tablet_id: TabletId,
        reason: WriteBarrierReason,
    },

    #[error("Read fan-in limit exceeded; please wait until your data is merged (tablet_id={tablet_id}, fan_in={fan_in}, fan_in_limit={fan_in_limit})")]
    FanInExceeded {
        tablet_id: TabletId,
        fan_in: usize,
        fan_in_limit: usize,
    },

    #[error("Transaction {txn_id} is incomplete: expected signature {expected:#x}, actual signature {actual:#x}")]
    SignatureMismatch {
        txn_id: TxnId,
        expected: TransactionSignature,
        actual: TransactionSignature,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Timestamp {timestamp} is not newer than {latest} on key {key}")]
    TimestampOutOfOrder {
        key: String,
        timestamp: Timestamp,
        latest: Timestamp,
    },

    #[error("No such transaction {0}")]
    NoSuchTransaction(TxnId),

    #[error("Transaction {txn_id} is in state {state} and cannot {operation}")]
    InvalidTransactionState {
        txn_id: TxnId,
        state: String,
        operation: &'static str,
    },

    #[error("No such store {0}")]
    NoSuchStore(StoreId),

    #[error("Not an active leader: {0}")]
    NotLeader(String),

    #[error("Snapshot version {found} is not supported (expected {min_supported}..={current})")]
    SnapshotVersion {
        found: u32,
        min_supported: u32,
        current: u32,
    },

    #[error("Snapshot is corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal bug; never expected in production.
    #[error("InternalBug [{error_code}]: {message}")]
    Internal {
        error_code: &'static str,
        message: String,
    },
}

impl TabletError {
    pub fn internal(error_code: &'static str, message: impl Into<String>) -> Self {
        TabletError::Internal {
            error_code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TabletError::LockConflict { .. } => ErrorKind::Retryable,
            TabletError::FanInExceeded { .. } => ErrorKind::Transient,
            TabletError::NotLeader(_) => ErrorKind::Transient,
            TabletError::Io(_) => ErrorKind::Transient,
            TabletError::SignatureMismatch { .. } => ErrorKind::UserError,
            TabletError::NoSuchTransaction(_) => ErrorKind::UserError,
            TabletError::InvalidTransactionState { .. } => ErrorKind::UserError,
            TabletError::NoSuchStore(_) => ErrorKind::UserError,
            TabletError::TimestampOutOfOrder { .. } => ErrorKind::UserError,
            TabletError::InvalidSchema(_) => ErrorKind::UserError,
            TabletError::WriteBarrier { .. } => ErrorKind::InternalBug,
            TabletError::Unsupported(_) => ErrorKind::InternalBug,
            TabletError::SnapshotVersion { .. } => ErrorKind::InternalBug,
            TabletError::SnapshotCorrupted(_) => ErrorKind::InternalBug,
            TabletError::Serialization(_) => ErrorKind::InternalBug,
            TabletError::Internal { .. } => ErrorKind::InternalBug,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, TabletError::LockConflict { .. })
    }
}

impl From<bincode::Error> for TabletError {
    fn from(e: bincode::Error) -> Self {
        TabletError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_conflict_message() {
        let err = TabletError::LockConflict {
            txn_id: TxnId(2),
            key: "[1]".into(),
            lock_index: 0,
            winner: LockConflictWinner::Transaction(TxnId(1)),
        };
        assert!(err.to_string().contains("lock conflict due to concurrent write"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_write_barrier_messages() {
        let pending = TabletError::WriteBarrier {
            tablet_id: TabletId(1),
            reason: WriteBarrierReason::UserWritesPending,
        };
        let in_flight = TabletError::WriteBarrier {
            tablet_id: TabletId(1),
            reason: WriteBarrierReason::UserMutationsInFlight,
        };
        assert!(pending.to_string().contains("user writes are still pending"));
        assert!(in_flight.to_string().contains("user mutations are still in flight"));
        assert_eq!(pending.kind(), ErrorKind::InternalBug);
    }

    #[test]
    fn test_fan_in_attributes() {
        let err = TabletError::FanInExceeded {
            tablet_id: TabletId(3),
            fan_in: 5,
            fan_in_limit: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("fan_in=5"));
        assert!(msg.contains("fan_in_limit=4"));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_signature_message() {
        let err = TabletError::SignatureMismatch {
            txn_id: TxnId(1),
            expected: 0xffff_ffff,
            actual: 1,
        };
        assert!(err.to_string().contains("expected signature"));
    }
}
