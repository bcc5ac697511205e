pub mod transaction;

pub use transaction::{TransactionRepository, TransactionSink};
