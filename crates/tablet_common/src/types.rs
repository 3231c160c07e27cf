use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a tablet (a contiguous shard of a table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletId(pub u64);

/// Identifier of a store within a tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(pub u64);

/// Identifier of a partition within a sorted tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u64);

/// Transaction identifier. `TxnId::NONE` is never issued; it marks a free lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    pub const NONE: TxnId = TxnId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Logical timestamp assigned by the external ordering layer.
///
/// The top of the range is reserved for sentinels; real commit timestamps
/// always lie in `[MIN, MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const NULL: Timestamp = Timestamp(0);
    pub const MIN: Timestamp = Timestamp(0x0000_0000_0000_0001);
    pub const MAX: Timestamp = Timestamp(0x3fff_ffff_ffff_ff00);
    /// Reads at this timestamp observe every committed version.
    pub const ALL_COMMITTED: Timestamp = Timestamp(0x3fff_ffff_ffff_ff03);
    /// Placeholder written into an uncommitted edit list slot.
    pub const UNCOMMITTED: Timestamp = Timestamp(0x3fff_ffff_ffff_ff04);
    /// Prepare timestamp of a lock whose owner has not prepared yet.
    pub const NOT_PREPARED: Timestamp = Timestamp(0x3fff_ffff_ffff_ffff);

    pub fn next(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }

    pub fn is_sentinel(self) -> bool {
        self > Self::MAX
    }
}

/// Accumulated acknowledgement of a transaction's write batches.
pub type TransactionSignature = u32;

/// Retry counter distinguishing resubmissions of the same write batch.
pub type TransactionGeneration = u32;

pub const INITIAL_TRANSACTION_SIGNATURE: TransactionSignature = 0;
/// A transaction is complete once its partial signatures sum (wrapping) to this.
pub const FINAL_TRANSACTION_SIGNATURE: TransactionSignature = 0xffff_ffff;
pub const INITIAL_TRANSACTION_GENERATION: TransactionGeneration = 0;

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timestamp::ALL_COMMITTED => write!(f, "ts:all-committed"),
            Timestamp::UNCOMMITTED => write!(f, "ts:uncommitted"),
            Timestamp::NOT_PREPARED => write!(f, "ts:not-prepared"),
            Timestamp(v) => write!(f, "ts:{:#x}", v),
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tablet:{}", self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store:{}", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition:{}", self.0)
    }
}
