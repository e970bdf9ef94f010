//! Scoped transaction guard
//!
//! Owns an open transaction and guarantees it is released exactly once:
//! `commit` and `rollback` consume the guard, and a guard dropped while still
//! holding its transaction (early return, panic, aborted task) drops the
//! transaction, which the store contract turns into a rollback.

use super::{AccessMode, IsolationLevel, StoreTransaction, TransactionalStore};
use crate::error::HarnessError;
use crate::transfer::AccountId;

pub struct TxGuard {
    tx: Option<Box<dyn StoreTransaction>>,
    isolation: IsolationLevel,
}

impl TxGuard {
    /// Open a transaction on `store`
    pub async fn begin(
        store: &dyn TransactionalStore,
        isolation: IsolationLevel,
        mode: AccessMode,
    ) -> Result<Self, HarnessError> {
        let tx = store.begin(isolation, mode).await?;
        Ok(Self {
            tx: Some(tx),
            isolation,
        })
    }

    fn live(&mut self) -> Result<&mut Box<dyn StoreTransaction>, HarnessError> {
        self.tx
            .as_mut()
            .ok_or_else(|| HarnessError::Store("transaction already finished".to_string()))
    }

    pub async fn read_balance(&mut self, account: AccountId) -> Result<i64, HarnessError> {
        self.live()?.read_balance(account).await
    }

    pub async fn write_balance(
        &mut self,
        account: AccountId,
        balance: i64,
    ) -> Result<u64, HarnessError> {
        self.live()?.write_balance(account, balance).await
    }

    /// Commit and release. A failed commit leaves nothing to roll back.
    pub async fn commit(mut self) -> Result<(), HarnessError> {
        match self.tx.take() {
            Some(tx) => tx.commit().await,
            None => Err(HarnessError::Store("transaction already finished".to_string())),
        }
    }

    pub async fn rollback(mut self) -> Result<(), HarnessError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }
}

impl TxGuard {
    /// Release without waiting on the store. Used after a store call was cut
    /// off by cancellation; dropping the transaction rolls it back.
    pub fn abandon(mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::debug!(isolation = %self.isolation, "Transaction abandoned on cancellation");
            drop(tx);
        }
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::warn!(
                isolation = %self.isolation,
                "Transaction guard dropped while open - rolling back"
            );
            drop(tx);
        }
    }
}
