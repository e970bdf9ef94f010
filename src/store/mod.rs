//! Transactional Store Capability
//!
//! The harness never implements isolation itself. It only talks to a store
//! through these two traits, so the same executor, verifier and orchestrator
//! run against PostgreSQL in production and against an in-memory simulation
//! in tests.
//!
//! # Contract
//!
//! 1. `begin` fails with [`HarnessError::Connection`] when no connection is available
//! 2. `commit` may fail with [`HarnessError::Conflict`] (SQLSTATE 40001 / 40P01)
//! 3. Dropping an unfinished [`StoreTransaction`] MUST roll it back

pub mod guard;
pub mod postgres;

#[cfg(test)]
pub mod memory;

pub use guard::TxGuard;
pub use postgres::PgStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::transfer::AccountId;

/// Transaction isolation level requested at `BEGIN`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL fragment for `SET TRANSACTION ISOLATION LEVEL ...`
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Serializable => "serializable",
        }
    }

    /// Whether the level works from a single transaction-wide snapshot
    #[inline]
    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(HarnessError::Config(format!(
                "unknown isolation level: {}",
                other
            ))),
        }
    }
}

/// Transaction access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

/// A store that can open transactions at a requested isolation level
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Store name for logging
    fn name(&self) -> &'static str;

    /// Open a transaction. Each call holds one connection until the
    /// transaction is committed, rolled back or dropped.
    async fn begin(
        &self,
        isolation: IsolationLevel,
        mode: AccessMode,
    ) -> Result<Box<dyn StoreTransaction>, HarnessError>;
}

/// One open transaction
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read an account balance (plain read, no row lock)
    async fn read_balance(&mut self, account: AccountId) -> Result<i64, HarnessError>;

    /// Overwrite an account balance, returning the number of affected rows
    async fn write_balance(&mut self, account: AccountId, balance: i64)
    -> Result<u64, HarnessError>;

    async fn commit(self: Box<Self>) -> Result<(), HarnessError>;

    async fn rollback(self: Box<Self>) -> Result<(), HarnessError>;
}
