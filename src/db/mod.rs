//! Database connection management

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::{CampaignConfig, RunConfig};
use crate::error::HarnessError;
use crate::store::PgStore;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id BIGINT PRIMARY KEY,
    balance BIGINT NOT NULL
)"#;

const UPSERT_ACCOUNT: &str = r#"
INSERT INTO accounts (id, balance) VALUES ($1, $2)
ON CONFLICT (id) DO UPDATE SET balance = EXCLUDED.balance"#;

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create the pool. Its size is fixed at `run.max_connections`.
    pub async fn connect(database_url: &str, run: &RunConfig) -> Result<Self, HarnessError> {
        let max_connections = u32::try_from(run.max_connections).unwrap_or(u32::MAX);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .map_err(|e| HarnessError::Connection(e.to_string()))?;

        tracing::info!(max_connections, "PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Transactional store backed by this pool
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), HarnessError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| HarnessError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Create the `accounts` table if needed and upsert both campaign
    /// accounts at their starting balances.
    pub async fn ensure_schema(&self, campaign: &CampaignConfig) -> Result<(), HarnessError> {
        sqlx::query(CREATE_ACCOUNTS_TABLE)
            .execute(&self.pool)
            .await?;

        for (account, balance) in [
            (campaign.source_account, campaign.initial_source_balance),
            (campaign.dest_account, campaign.initial_dest_balance),
        ] {
            sqlx::query(UPSERT_ACCOUNT)
                .bind(account.get())
                .bind(balance)
                .execute(&self.pool)
                .await?;
        }

        tracing::info!(
            source = %campaign.source_account,
            dest = %campaign.dest_account,
            "Accounts table ready"
        );
        Ok(())
    }
}
