//! Transaction Executor
//!
//! Runs one [`TransferAttempt`] inside one store transaction:
//!
//! 1. BEGIN at the requested isolation level
//! 2. Read source (decrementing) balance, then destination balance
//! 3. If source >= amount: write dest + amount, then source - amount
//! 4. Otherwise write nothing ([`TransferOutcome::InsufficientFunds`])
//! 5. If the cancellation token fired: roll back with [`HarnessError::Cancelled`]
//! 6. Otherwise COMMIT
//!
//! BEGIN, reads and writes are raced against the token, so a deadline cuts
//! off a slow store call instead of waiting for it. COMMIT is never raced.
//!
//! No `FOR UPDATE`, no client-side locks: conflicts are left to the
//! isolation level. Any failure rolls the transaction back through
//! [`TxGuard`]; nothing is retried.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::state::TxState;
use super::types::{TransferAttempt, TransferOutcome};
use crate::error::HarnessError;
use crate::store::{AccessMode, IsolationLevel, TransactionalStore, TxGuard};

/// Result of one run plus every state it went through
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub result: Result<TransferOutcome, HarnessError>,
    pub states: Vec<TxState>,
}

impl ExecutionReport {
    /// Terminal state of the run
    pub fn final_state(&self) -> TxState {
        self.states.last().copied().unwrap_or(TxState::Idle)
    }
}

/// State tracker for one run
struct Run {
    states: Vec<TxState>,
}

impl Run {
    fn new() -> Self {
        Self {
            states: vec![TxState::Idle],
        }
    }

    fn current(&self) -> TxState {
        self.states.last().copied().unwrap_or(TxState::Idle)
    }

    fn advance(&mut self, next: TxState) {
        let current = self.current();
        debug_assert!(
            current.can_transition_to(next),
            "illegal executor transition {} -> {}",
            current,
            next
        );
        trace!(from = %current, to = %next, "Executor transition");
        self.states.push(next);
    }

    fn finish(
        mut self,
        result: Result<TransferOutcome, HarnessError>,
    ) -> ExecutionReport {
        let terminal = if result.is_ok() {
            TxState::Committed
        } else {
            TxState::RolledBack
        };
        self.advance(terminal);
        ExecutionReport {
            result,
            states: self.states,
        }
    }
}

/// Race one store call against the token. The call is dropped when the token
/// fires; its transaction is then abandoned, which rolls it back.
async fn until_cancelled<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, HarnessError>>,
) -> Result<T, HarnessError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HarnessError::Cancelled),
        result = call => result,
    }
}

/// Executes transfer attempts against a shared store
#[derive(Clone)]
pub struct TransactionExecutor {
    store: Arc<dyn TransactionalStore>,
}

impl TransactionExecutor {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self { store }
    }

    /// Run one attempt and return its classified outcome
    pub async fn execute(
        &self,
        isolation: IsolationLevel,
        attempt: TransferAttempt,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, HarnessError> {
        self.execute_traced(isolation, attempt, cancel).await.result
    }

    /// Run one attempt, recording the state path
    pub async fn execute_traced(
        &self,
        isolation: IsolationLevel,
        attempt: TransferAttempt,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let mut run = Run::new();

        let begin = TxGuard::begin(self.store.as_ref(), isolation, AccessMode::ReadWrite);
        let mut guard = match until_cancelled(cancel, begin).await {
            Ok(guard) => guard,
            Err(e) => {
                debug!(isolation = %isolation, error = %e, "BEGIN failed");
                return run.finish(Err(e));
            }
        };
        run.advance(TxState::Began);

        let result = match Self::apply(&mut guard, &mut run, attempt, cancel).await {
            // Never commit once the token fired: the whole transfer disappears
            Ok(_) if cancel.is_cancelled() => Err(HarnessError::Cancelled),
            other => other,
        };

        let result = match result {
            Ok(outcome) => guard.commit().await.map(|()| outcome),
            // A store call may have been cut off mid-flight; don't wait on it again
            Err(HarnessError::Cancelled) => {
                guard.abandon();
                Err(HarnessError::Cancelled)
            }
            Err(e) => {
                if let Err(rb) = guard.rollback().await {
                    warn!(error = %rb, cause = %e, "Rollback failed");
                }
                Err(e)
            }
        };

        match &result {
            Ok(outcome) => debug!(isolation = %isolation, outcome = %outcome, "Transfer committed"),
            Err(e) if e.is_benign() => {
                debug!(isolation = %isolation, code = e.code(), "Transfer conflicted")
            }
            Err(e) => debug!(isolation = %isolation, error = %e, "Transfer rolled back"),
        }
        run.finish(result)
    }

    /// Steps 2-4: reads and conditional writes
    async fn apply(
        guard: &mut TxGuard,
        run: &mut Run,
        attempt: TransferAttempt,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, HarnessError> {
        let source_balance = until_cancelled(cancel, guard.read_balance(attempt.source())).await?;
        run.advance(TxState::ReadSource);

        let dest_balance = until_cancelled(cancel, guard.read_balance(attempt.dest())).await?;
        run.advance(TxState::ReadDest);

        if source_balance < attempt.amount() {
            run.advance(TxState::NoOp);
            return Ok(TransferOutcome::InsufficientFunds);
        }

        let new_dest = dest_balance
            .checked_add(attempt.amount())
            .ok_or_else(|| {
                HarnessError::InvalidAttempt(format!(
                    "balance overflow on account {}",
                    attempt.dest()
                ))
            })?;
        let new_source = source_balance - attempt.amount();

        until_cancelled(cancel, guard.write_balance(attempt.dest(), new_dest)).await?;
        until_cancelled(cancel, guard.write_balance(attempt.source(), new_source)).await?;
        run.advance(TxState::Updated);

        Ok(TransferOutcome::Transferred)
    }
}
