//! Concurrency Orchestrator
//!
//! Fans out one batch of transfer attempts through a bounded [`TaskGroup`]
//! and tallies the outcomes.
//!
//! # Failure Policy
//!
//! Fail-fast but completely accounted:
//! 1. The first fatal error cancels the batch token
//! 2. Every launched attempt is still awaited before returning
//! 3. Conflicts and insufficient funds are recorded, never cancel anything

pub mod task_group;

pub use task_group::{GroupOutcome, TaskGroup};

use std::future::Future;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RunConfig;
use crate::error::HarnessError;
use crate::transfer::TransferOutcome;

/// Counters for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub launched: usize,
    /// Committed with or without writes
    pub committed: usize,
    /// Committed with writes
    pub transferred: usize,
    /// Committed without writes
    pub insufficient_funds: usize,
    pub conflicts: usize,
    pub cancelled: usize,
    /// Any other error (connection, store, panic)
    pub failed: usize,
    pub peak_in_flight: usize,
}

impl BatchStats {
    pub fn record(&mut self, result: &Result<TransferOutcome, HarnessError>) {
        match result {
            Ok(TransferOutcome::Transferred) => {
                self.committed += 1;
                self.transferred += 1;
            }
            Ok(TransferOutcome::InsufficientFunds) => {
                self.committed += 1;
                self.insufficient_funds += 1;
            }
            Err(e) if e.is_benign() => self.conflicts += 1,
            Err(HarnessError::Cancelled) => self.cancelled += 1,
            Err(_) => self.failed += 1,
        }
    }

    /// Every launched attempt reached exactly one terminal bucket
    pub fn is_fully_accounted(&self) -> bool {
        self.committed + self.conflicts + self.cancelled + self.failed == self.launched
    }
}

/// Outcome of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub stats: BatchStats,
    pub first_error: Option<HarnessError>,
    /// First connection failure, even when another fatal error came first
    pub connection_error: Option<HarnessError>,
}

pub struct ConcurrencyOrchestrator {
    run_config: RunConfig,
}

impl ConcurrencyOrchestrator {
    pub fn new(run_config: RunConfig) -> Self {
        Self { run_config }
    }

    /// Launch `attempts_per_batch` invocations built by `factory`, at most
    /// `concurrency` at a time, and wait for all of them.
    ///
    /// `factory` gets the attempt index and the batch token. The batch token
    /// is a child of `cancel`: a fatal error cancels this batch only.
    pub async fn run_batch<F, Fut>(&self, cancel: &CancellationToken, factory: F) -> BatchReport
    where
        F: Fn(usize, CancellationToken) -> Fut,
        Fut: Future<Output = Result<TransferOutcome, HarnessError>> + Send + 'static,
    {
        let attempts = self.run_config.attempts();
        let limit = self.run_config.concurrency_limit();
        let mut group = TaskGroup::new(limit, cancel.child_token());

        for index in 0..attempts {
            let work = factory(index, group.token().clone());
            group.spawn(move |_| work);
        }

        let outcome = group.join().await;

        let mut stats = BatchStats {
            launched: outcome.results.len(),
            peak_in_flight: outcome.peak_in_flight,
            ..BatchStats::default()
        };
        for result in &outcome.results {
            stats.record(result);
        }
        let connection_error = outcome
            .results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .find(|e| e.is_connection())
            .cloned();

        debug!(
            launched = stats.launched,
            transferred = stats.transferred,
            insufficient_funds = stats.insufficient_funds,
            conflicts = stats.conflicts,
            cancelled = stats.cancelled,
            failed = stats.failed,
            peak_in_flight = stats.peak_in_flight,
            "Batch finished"
        );

        BatchReport {
            stats,
            first_error: outcome.first_error,
            connection_error,
        }
    }
}
