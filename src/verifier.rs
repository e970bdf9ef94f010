//! Invariant Verifier
//!
//! The harness's only correctness oracle. After every batch it opens a
//! read-only snapshot transaction and checks:
//!
//! - `balance(source) + balance(dest) == expected_total`
//! - `balance(source) >= 0` and `balance(dest) >= 0`
//!
//! A failed check is an [`HarnessError::InvariantViolation`], never a conflict.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::HarnessError;
use crate::store::{AccessMode, IsolationLevel, TransactionalStore, TxGuard};
use crate::transfer::AccountId;

/// Isolation used for verification reads: one consistent snapshot for both rows
pub const VERIFY_ISOLATION: IsolationLevel = IsolationLevel::RepeatableRead;

/// Both balances as seen by one verification transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub source_balance: i64,
    pub dest_balance: i64,
}

impl BalanceSnapshot {
    #[inline]
    pub fn total(&self) -> i64 {
        self.source_balance.saturating_add(self.dest_balance)
    }
}

/// Check conservation and non-negativity
pub fn check_invariant(snapshot: BalanceSnapshot, expected_total: i64) -> Result<(), HarnessError> {
    let conserved = snapshot
        .source_balance
        .checked_add(snapshot.dest_balance)
        .is_some_and(|total| total == expected_total);

    if conserved && snapshot.source_balance >= 0 && snapshot.dest_balance >= 0 {
        Ok(())
    } else {
        Err(HarnessError::InvariantViolation {
            source_balance: snapshot.source_balance,
            dest_balance: snapshot.dest_balance,
            expected_total,
        })
    }
}

pub struct InvariantVerifier {
    store: Arc<dyn TransactionalStore>,
    source: AccountId,
    dest: AccountId,
    expected_total: i64,
}

impl InvariantVerifier {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        source: AccountId,
        dest: AccountId,
        expected_total: i64,
    ) -> Self {
        Self {
            store,
            source,
            dest,
            expected_total,
        }
    }

    /// Read both balances in one snapshot and check the invariant
    pub async fn verify(&self) -> Result<BalanceSnapshot, HarnessError> {
        let snapshot = self.read_snapshot().await?;

        match check_invariant(snapshot, self.expected_total) {
            Ok(()) => {
                debug!(
                    source_balance = snapshot.source_balance,
                    dest_balance = snapshot.dest_balance,
                    "Invariant holds"
                );
                Ok(snapshot)
            }
            Err(e) => {
                error!(
                    source_balance = snapshot.source_balance,
                    dest_balance = snapshot.dest_balance,
                    total = snapshot.total(),
                    expected_total = self.expected_total,
                    "INVARIANT VIOLATION"
                );
                Err(e)
            }
        }
    }

    async fn read_snapshot(&self) -> Result<BalanceSnapshot, HarnessError> {
        let mut guard =
            TxGuard::begin(self.store.as_ref(), VERIFY_ISOLATION, AccessMode::ReadOnly).await?;

        let reads = async {
            let source_balance = guard.read_balance(self.source).await?;
            let dest_balance = guard.read_balance(self.dest).await?;
            Ok::<_, HarnessError>(BalanceSnapshot {
                source_balance,
                dest_balance,
            })
        }
        .await;

        match reads {
            Ok(snapshot) => {
                guard.commit().await?;
                Ok(snapshot)
            }
            Err(e) => {
                if let Err(rb) = guard.rollback().await {
                    warn!(error = %rb, cause = %e, "Rollback after failed verification failed");
                }
                Err(e)
            }
        }
    }
}
