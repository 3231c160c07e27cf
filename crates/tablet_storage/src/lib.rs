//! Dynamic store engine of a tablet: edit-list rows, sorted and ordered
//! in-memory stores, flushed chunks, store managers, and merging readers.

pub mod chunk_store;
pub mod comparer;
pub mod dynamic_row;
pub mod ordered_dynamic_store;
pub mod reader;
pub mod row_merger;
pub mod snapshot;
pub mod sorted_dynamic_store;
pub mod store;
pub mod store_manager;
pub mod tablet;

#[cfg(test)]
mod tests;

pub use comparer::{KeyBound, RowKey};
pub use sorted_dynamic_store::{DynamicRowRef, SortedDynamicStore};
pub use store::{Store, StoreState};
pub use store_manager::{
    OrderedStoreManager, ReplicatedStoreManager, SortedStoreManager, StoreManager, TabletStoreManager, WireCommand,
    WriteContext,
};
pub use tablet::{Tablet, TabletSnapshot};
