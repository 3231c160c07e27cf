//! Common store surface: identity, lifecycle state, and the reader entry
//! points the tablet reader fans out over.
//!
//! ```text
//!  ActiveDynamic ──rotate──▶ PassiveDynamic ──flush──▶ Removed
//!                                 │                      ▲
//!                                 └──(chunk)──▶ Persistent ──compaction──┘
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tablet_common::types::{StoreId, Timestamp};
use tablet_common::value::{ColumnId, VersionedRow};

use crate::chunk_store::{OrderedChunkStore, SortedChunkStore};
use crate::comparer::{KeyBound, RowKey};
use crate::ordered_dynamic_store::OrderedDynamicStore;
use crate::sorted_dynamic_store::SortedDynamicStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    /// Accepts writes.
    ActiveDynamic,
    /// Rotated out; serves reads until flushed.
    PassiveDynamic,
    /// Immutable chunk produced by a flush or a compaction.
    Persistent,
    Removed,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreState::ActiveDynamic => write!(f, "ACTIVE_DYNAMIC"),
            StoreState::PassiveDynamic => write!(f, "PASSIVE_DYNAMIC"),
            StoreState::Persistent => write!(f, "PERSISTENT"),
            StoreState::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Progress of a flush or compaction on one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreActivityState {
    None,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    pub state: StoreState,
    pub flush_state: StoreActivityState,
    pub compaction_state: StoreActivityState,
}

/// Identity and mutable lifecycle status shared by every store kind.
pub struct StoreMeta {
    id: StoreId,
    status: Mutex<StoreStatus>,
}

impl StoreMeta {
    pub fn new(id: StoreId, state: StoreState) -> Self {
        Self {
            id,
            status: Mutex::new(StoreStatus {
                state,
                flush_state: StoreActivityState::None,
                compaction_state: StoreActivityState::None,
            }),
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn status(&self) -> StoreStatus {
        *self.status.lock()
    }

    pub fn state(&self) -> StoreState {
        self.status.lock().state
    }

    pub fn set_state(&self, state: StoreState) {
        self.status.lock().state = state;
    }

    pub fn flush_state(&self) -> StoreActivityState {
        self.status.lock().flush_state
    }

    pub fn set_flush_state(&self, state: StoreActivityState) {
        self.status.lock().flush_state = state;
    }

    pub fn compaction_state(&self) -> StoreActivityState {
        self.status.lock().compaction_state
    }

    pub fn set_compaction_state(&self, state: StoreActivityState) {
        self.status.lock().compaction_state = state;
    }
}

pub type VersionedRowIter = Box<dyn Iterator<Item = VersionedRow> + Send>;

/// Any store a tablet can hold.
#[derive(Clone)]
pub enum Store {
    SortedDynamic(Arc<SortedDynamicStore>),
    SortedChunk(Arc<SortedChunkStore>),
    OrderedDynamic(Arc<OrderedDynamicStore>),
    OrderedChunk(Arc<OrderedChunkStore>),
}

impl Store {
    pub fn meta(&self) -> &StoreMeta {
        match self {
            Store::SortedDynamic(s) => s.meta(),
            Store::SortedChunk(s) => s.meta(),
            Store::OrderedDynamic(s) => s.meta(),
            Store::OrderedChunk(s) => s.meta(),
        }
    }

    pub fn id(&self) -> StoreId {
        self.meta().id()
    }

    pub fn state(&self) -> StoreState {
        self.meta().state()
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Store::SortedDynamic(_) | Store::OrderedDynamic(_))
    }

    pub fn is_sorted(&self) -> bool {
        matches!(self, Store::SortedDynamic(_) | Store::SortedChunk(_))
    }

    pub fn as_sorted_dynamic(&self) -> Option<&Arc<SortedDynamicStore>> {
        match self {
            Store::SortedDynamic(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_ordered_dynamic(&self) -> Option<&Arc<OrderedDynamicStore>> {
        match self {
            Store::OrderedDynamic(s) => Some(s),
            _ => None,
        }
    }

    /// Smallest key the store may contain. Dynamic stores are unbounded.
    pub fn min_key(&self) -> KeyBound {
        match self {
            Store::SortedChunk(s) => s.min_key(),
            _ => KeyBound::Min,
        }
    }

    /// Largest key the store may contain (inclusive).
    pub fn max_key(&self) -> KeyBound {
        match self {
            Store::SortedChunk(s) => s.max_key(),
            _ => KeyBound::Max,
        }
    }

    pub fn row_count(&self) -> u64 {
        match self {
            Store::SortedDynamic(s) => s.row_count(),
            Store::SortedChunk(s) => s.row_count(),
            Store::OrderedDynamic(s) => s.row_count(),
            Store::OrderedChunk(s) => s.row_count(),
        }
    }

    pub fn min_timestamp(&self) -> Timestamp {
        match self {
            Store::SortedDynamic(s) => s.min_timestamp(),
            Store::SortedChunk(s) => s.min_timestamp(),
            Store::OrderedDynamic(s) => s.min_timestamp(),
            Store::OrderedChunk(s) => s.min_timestamp(),
        }
    }

    pub fn max_timestamp(&self) -> Timestamp {
        match self {
            Store::SortedDynamic(s) => s.max_timestamp(),
            Store::SortedChunk(s) => s.max_timestamp(),
            Store::OrderedDynamic(s) => s.max_timestamp(),
            Store::OrderedChunk(s) => s.max_timestamp(),
        }
    }

    /// Versioned rows with keys in `[lower, upper)`, history cut at `timestamp`.
    /// Ordered stores have no keys and yield nothing.
    pub fn create_versioned_reader(
        &self,
        lower: &KeyBound,
        upper: &KeyBound,
        timestamp: Timestamp,
        column_filter: Option<&[ColumnId]>,
    ) -> VersionedRowIter {
        match self {
            Store::SortedDynamic(s) => Box::new(s.create_reader(
                lower.clone(),
                upper.clone(),
                timestamp,
                column_filter.map(|f| f.to_vec()),
            )),
            Store::SortedChunk(s) => Box::new(
                s.read_range(lower, upper, timestamp, column_filter)
                    .into_iter(),
            ),
            Store::OrderedDynamic(_) | Store::OrderedChunk(_) => Box::new(std::iter::empty()),
        }
    }

    pub fn lookup_row(
        &self,
        key: &RowKey,
        timestamp: Timestamp,
        column_filter: Option<&[ColumnId]>,
    ) -> Option<VersionedRow> {
        match self {
            Store::SortedDynamic(s) => s.lookup_row(key, timestamp, column_filter),
            Store::SortedChunk(s) => s.lookup_row(key, timestamp, column_filter),
            Store::OrderedDynamic(_) | Store::OrderedChunk(_) => None,
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Store::SortedDynamic(_) => "SortedDynamic",
            Store::SortedChunk(_) => "SortedChunk",
            Store::OrderedDynamic(_) => "OrderedDynamic",
            Store::OrderedChunk(_) => "OrderedChunk",
        };
        write!(f, "{}({}, {})", kind, self.id(), self.state())
    }
}
