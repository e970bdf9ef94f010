//! Isolation Lab - Transaction Isolation Test Harness
//!
//! Hammers two accounts with concurrent conditional transfers under each
//! configured isolation level and checks that money is conserved.
//!
//! # Modules
//!
//! - [`config`] - YAML configuration (`config/{env}.yaml`)
//! - [`logging`] - tracing subscriber setup
//! - [`error`] - Error taxonomy and SQLSTATE classification
//! - [`db`] - PostgreSQL pool, health check and schema
//! - [`store`] - Transactional store seam and scoped transaction guard
//! - [`transfer`] - One conditional transfer per transaction
//! - [`orchestrator`] - Bounded fan-out with a shared cancellation token
//! - [`verifier`] - Read-only invariant check
//! - [`campaign`] - Reset → orchestrate → verify loop per isolation level

pub mod campaign;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod store;
pub mod transfer;
pub mod verifier;

// Convenient re-exports at crate root
pub use campaign::{CampaignSummary, TestCampaign, TestOutcome, Verdict};
pub use config::{AppConfig, CampaignConfig, RunConfig};
pub use error::HarnessError;
pub use orchestrator::{BatchReport, BatchStats, ConcurrencyOrchestrator, TaskGroup};
pub use store::{AccessMode, IsolationLevel, PgStore, TransactionalStore, TxGuard};
pub use transfer::{AccountId, TransactionExecutor, TransferAttempt, TransferOutcome};
pub use verifier::{BalanceSnapshot, InvariantVerifier};
