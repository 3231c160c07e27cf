//! Transactional write path of a tablet: transactions, the write manager
//! that locks and commits their rows, and the cell that applies mutations
//! in log order.

pub mod cell;
pub mod manager;
pub mod transaction;
pub mod write_manager;


pub use cell::{CellState, Mutation, MutationHandle, TabletCell};
pub use manager::{TransactionManager, TransactionOutcome, TransactionRecord, TransactionStatsSnapshot};
pub use transaction::{SavedTransaction, Transaction, TransactionState, WriteLogEntry};
pub use write_manager::{TabletWriteManager, WriteRowsMutation};
