//! PostgreSQL Store
//!
//! Plain `SELECT` / `UPDATE` statements inside a transaction whose isolation
//! level is set right after `BEGIN`. No `FOR UPDATE`: the isolation level is
//! the only concurrency control.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use super::{AccessMode, IsolationLevel, StoreTransaction, TransactionalStore};
use crate::error::HarnessError;
use crate::transfer::AccountId;

/// Store backed by a shared `PgPool`
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Build the `SET TRANSACTION` statement for the requested options
pub(crate) fn set_transaction_sql(isolation: IsolationLevel, mode: AccessMode) -> String {
    match mode {
        AccessMode::ReadWrite => format!("SET TRANSACTION ISOLATION LEVEL {}", isolation.as_sql()),
        AccessMode::ReadOnly => format!(
            "SET TRANSACTION ISOLATION LEVEL {}, READ ONLY",
            isolation.as_sql()
        ),
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(
        &self,
        isolation: IsolationLevel,
        mode: AccessMode,
    ) -> Result<Box<dyn StoreTransaction>, HarnessError> {
        // Any failure to obtain a connection and BEGIN is a connection problem
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HarnessError::Connection(e.to_string()))?;

        // Must be the first statement of the transaction
        sqlx::query(&set_transaction_sql(isolation, mode))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgStoreTransaction { tx }))
    }
}

/// Open PostgreSQL transaction. sqlx rolls it back when dropped unfinished.
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn read_balance(&mut self, account: AccountId) -> Result<i64, HarnessError> {
        let balance =
            sqlx::query_scalar::<_, i64>("SELECT balance FROM accounts WHERE id = $1")
                .bind(account.get())
                .fetch_optional(&mut *self.tx)
                .await?;

        balance.ok_or(HarnessError::AccountNotFound(account))
    }

    async fn write_balance(
        &mut self,
        account: AccountId,
        balance: i64,
    ) -> Result<u64, HarnessError> {
        let result = sqlx::query("UPDATE accounts SET balance = $1 WHERE id = $2")
            .bind(balance)
            .bind(account.get())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(HarnessError::AccountNotFound(account));
        }
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), HarnessError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), HarnessError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
