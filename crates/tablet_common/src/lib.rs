pub mod bg_supervisor;
pub mod config;
pub mod error;
pub mod schema;
pub mod types;
pub mod value;

pub use error::{ErrorKind, TabletError, TabletResult};
pub use types::{
    PartitionId, StoreId, TabletId, Timestamp, TransactionGeneration, TransactionSignature, TxnId,
    FINAL_TRANSACTION_SIGNATURE, INITIAL_TRANSACTION_GENERATION, INITIAL_TRANSACTION_SIGNATURE,
};
