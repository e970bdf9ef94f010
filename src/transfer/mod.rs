//! Conditional Balance Transfer
//!
//! One [`TransferAttempt`] moves a fixed amount from a source account to a
//! destination account inside a single store transaction, but only when the
//! source can afford it. The [`TransactionExecutor`] walks the [`TxState`]
//! machine and always ends in COMMITTED or ROLLED_BACK.

pub mod executor;
pub mod state;
pub mod types;

pub use executor::{ExecutionReport, TransactionExecutor};
pub use state::TxState;
pub use types::{AccountId, TransferAttempt, TransferOutcome};
