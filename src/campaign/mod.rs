//! Test Campaign
//!
//! Drives repeated batches for every configured isolation level:
//!
//! ```text
//! for level in isolation_levels:
//!     for rep in 0..repetitions:
//!         reset balances → orchestrate batch → verify invariant
//! ```
//!
//! # Cancellation
//!
//! One root token per campaign, cancelled when `timeout` elapses. Batches run
//! under child tokens, so a fatal batch error stops only that batch. Reset
//! and verification ignore the batch token. Every step of a repetition must
//! finish within `grace_period` of the instant the deadline fired; whatever
//! is still running then is abandoned and the campaign stops.
//!
//! # Error Policy
//!
//! - Connection errors abort the campaign
//! - Invariant violations are counted and the campaign keeps going
//! - Conflicts are counted, never retried


use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::config::{CampaignConfig, RunConfig};
use crate::error::HarnessError;
use crate::orchestrator::{BatchReport, BatchStats, ConcurrencyOrchestrator};
use crate::store::{AccessMode, IsolationLevel, TransactionalStore, TxGuard};
use crate::transfer::{TransactionExecutor, TransferAttempt};
use crate::verifier::{BalanceSnapshot, InvariantVerifier};

/// Isolation used to write the starting balances
pub const RESET_ISOLATION: IsolationLevel = IsolationLevel::ReadCommitted;

/// Write both starting balances in one transaction. Idempotent.
pub async fn reset_balances(
    store: &dyn TransactionalStore,
    campaign: &CampaignConfig,
) -> Result<(), HarnessError> {
    let mut guard = TxGuard::begin(store, RESET_ISOLATION, AccessMode::ReadWrite).await?;

    let writes = async {
        guard
            .write_balance(campaign.source_account, campaign.initial_source_balance)
            .await?;
        guard
            .write_balance(campaign.dest_account, campaign.initial_dest_balance)
            .await?;
        Ok::<_, HarnessError>(())
    }
    .await;

    match writes {
        Ok(()) => guard.commit().await,
        Err(e) => {
            if let Err(rb) = guard.rollback().await {
                warn!(error = %rb, "Rollback after failed reset failed");
            }
            Err(e)
        }
    }
}

/// Invariant failure observed after one repetition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub repetition: usize,
    pub snapshot: BalanceSnapshot,
}

/// Counters accumulated for one isolation level across repetitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestOutcome {
    pub isolation: IsolationLevel,
    /// Repetitions that ran a batch
    pub repetitions: usize,
    pub attempted: usize,
    pub committed: usize,
    pub transferred: usize,
    pub insufficient_funds: usize,
    pub conflict_failures: usize,
    pub cancelled: usize,
    /// Attempts that failed with a fatal error
    pub failed: usize,
    /// Batches stopped early by a fatal error
    pub batch_errors: usize,
    /// Batches that committed more transfers than the source could afford
    pub over_withdrawals: usize,
    pub invariant_violations: usize,
    /// Repetitions whose verification could not complete
    pub unverified: usize,
    /// Repetitions cut off when the grace period ran out
    pub abandoned: usize,
    pub peak_in_flight: usize,
    pub violations: Vec<Violation>,
}

impl TestOutcome {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            repetitions: 0,
            attempted: 0,
            committed: 0,
            transferred: 0,
            insufficient_funds: 0,
            conflict_failures: 0,
            cancelled: 0,
            failed: 0,
            batch_errors: 0,
            over_withdrawals: 0,
            invariant_violations: 0,
            unverified: 0,
            abandoned: 0,
            peak_in_flight: 0,
            violations: Vec::new(),
        }
    }

    pub fn absorb(&mut self, stats: &BatchStats) {
        self.repetitions += 1;
        self.attempted += stats.launched;
        self.committed += stats.committed;
        self.transferred += stats.transferred;
        self.insufficient_funds += stats.insufficient_funds;
        self.conflict_failures += stats.conflicts;
        self.cancelled += stats.cancelled;
        self.failed += stats.failed;
        self.peak_in_flight = self.peak_in_flight.max(stats.peak_in_flight);
    }

    /// Repetitions whose invariant check actually ran, pass or fail
    pub fn verified(&self) -> usize {
        self.repetitions.saturating_sub(self.unverified)
    }
}

/// Overall result of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every verified repetition held the invariant
    Held,
    Violated,
    /// Nothing was verified
    Inconclusive,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    pub store: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run: RunConfig,
    pub levels: Vec<TestOutcome>,
    /// Deadline fired before every repetition ran
    pub timed_out: bool,
}

impl CampaignSummary {
    pub fn total_violations(&self) -> usize {
        self.levels.iter().map(|l| l.invariant_violations).sum()
    }

    pub fn has_violations(&self) -> bool {
        self.total_violations() > 0
    }

    pub fn total_verified(&self) -> usize {
        self.levels.iter().map(TestOutcome::verified).sum()
    }

    /// Repetitions that ran but were never checked
    pub fn total_unverified(&self) -> usize {
        self.levels.iter().map(|l| l.unverified + l.abandoned).sum()
    }

    pub fn verdict(&self) -> Verdict {
        if self.has_violations() {
            Verdict::Violated
        } else if self.total_verified() == 0 {
            Verdict::Inconclusive
        } else {
            Verdict::Held
        }
    }

    pub fn level(&self, isolation: IsolationLevel) -> Option<&TestOutcome> {
        self.levels.iter().find(|l| l.isolation == isolation)
    }
}

/// Campaign deadline: the root token and the instant it fired
struct Deadline {
    root: CancellationToken,
    fired_at: Arc<OnceLock<Instant>>,
    grace: Duration,
    _timer: DropGuard,
}

impl Deadline {
    /// Cancel `root` once `timeout` elapses. Dropping the deadline stops the timer.
    fn arm(root: CancellationToken, timeout: Duration, grace: Duration) -> Self {
        let fired_at = Arc::new(OnceLock::new());
        let stop = CancellationToken::new();

        let timer_stop = stop.clone();
        let token = root.clone();
        let stamp = Arc::clone(&fired_at);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer_stop.cancelled() => {}
                _ = token.cancelled() => {
                    stamp.get_or_init(Instant::now);
                }
                _ = tokio::time::sleep(timeout) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Campaign deadline elapsed - cancelling");
                    // Stamp first: anyone woken by the cancel sees the instant
                    stamp.get_or_init(Instant::now);
                    token.cancel();
                }
            }
        });

        Self {
            root,
            fired_at,
            grace,
            _timer: stop.drop_guard(),
        }
    }

    fn token(&self) -> &CancellationToken {
        &self.root
    }

    fn has_fired(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Resolves `grace` after the deadline fired
    async fn grace_expired(&self) {
        self.root.cancelled().await;
        let fired = self.fired_at.get().copied().unwrap_or_else(Instant::now);
        tokio::time::sleep_until(fired + self.grace).await;
    }

    /// Run `fut` to completion unless the grace period runs out first
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, HarnessError>>,
    ) -> Result<T, HarnessError> {
        tokio::select! {
            result = fut => result,
            _ = self.grace_expired() => Err(HarnessError::Cancelled),
        }
    }
}

pub struct TestCampaign {
    store: Arc<dyn TransactionalStore>,
    run_config: RunConfig,
    campaign: CampaignConfig,
    attempt: TransferAttempt,
    executor: TransactionExecutor,
    orchestrator: ConcurrencyOrchestrator,
    verifier: InvariantVerifier,
}

impl TestCampaign {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        run_config: RunConfig,
        campaign: CampaignConfig,
    ) -> Result<Self, HarnessError> {
        run_config.validate()?;
        campaign.validate()?;

        let attempt = TransferAttempt::new(
            campaign.source_account,
            campaign.dest_account,
            campaign.transfer_amount,
        )?;
        let verifier = InvariantVerifier::new(
            Arc::clone(&store),
            campaign.source_account,
            campaign.dest_account,
            campaign.initial_total(),
        );

        Ok(Self {
            executor: TransactionExecutor::new(Arc::clone(&store)),
            orchestrator: ConcurrencyOrchestrator::new(run_config),
            verifier,
            attempt,
            store,
            run_config,
            campaign,
        })
    }

    /// Run every level with a fresh deadline
    pub async fn run(&self) -> Result<CampaignSummary, HarnessError> {
        self.run_with_token(CancellationToken::new()).await
    }

    /// Run every level under `root`; `root` is also cancelled at the deadline
    pub async fn run_with_token(
        &self,
        root: CancellationToken,
    ) -> Result<CampaignSummary, HarnessError> {
        let started_at = Utc::now();
        let deadline = Deadline::arm(
            root,
            self.run_config.timeout(),
            self.run_config.grace_period(),
        );

        info!(
            store = self.store.name(),
            levels = self.campaign.isolation_levels.len(),
            repetitions = self.run_config.repetitions,
            concurrency = self.run_config.concurrency,
            attempts = self.run_config.attempts(),
            timeout_ms = self.run_config.timeout_ms,
            "Starting isolation campaign"
        );

        let mut levels = Vec::with_capacity(self.campaign.isolation_levels.len());
        let mut timed_out = false;

        for &isolation in &self.campaign.isolation_levels {
            info!(isolation = %isolation, "============= {} =============", isolation);
            let mut outcome = TestOutcome::new(isolation);

            for repetition in 0..self.run_config.repetitions {
                if deadline.has_fired() {
                    timed_out = true;
                    break;
                }
                self.run_repetition(isolation, repetition, &deadline, &mut outcome)
                    .await?;
            }
            timed_out |= deadline.has_fired() && outcome.repetitions < self.run_config.repetitions;

            log_outcome(&outcome, self.campaign.max_affordable_transfers());
            levels.push(outcome);

            if timed_out {
                warn!(isolation = %isolation, "Campaign deadline reached - stopping");
                break;
            }
        }

        Ok(CampaignSummary {
            store: self.store.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            run: self.run_config,
            levels,
            timed_out,
        })
    }

    async fn run_batch(&self, isolation: IsolationLevel, root: &CancellationToken) -> BatchReport {
        self.orchestrator
            .run_batch(root, |_, token| {
                let executor = self.executor.clone();
                let attempt = self.attempt;
                async move { executor.execute(isolation, attempt, &token).await }
            })
            .await
    }

    async fn run_repetition(
        &self,
        isolation: IsolationLevel,
        repetition: usize,
        deadline: &Deadline,
        outcome: &mut TestOutcome,
    ) -> Result<(), HarnessError> {
        match deadline
            .bounded(reset_balances(self.store.as_ref(), &self.campaign))
            .await
        {
            Ok(()) => {}
            Err(HarnessError::Cancelled) => {
                outcome.abandoned += 1;
                warn!(isolation = %isolation, repetition, "Reset abandoned after deadline grace");
                return Ok(());
            }
            Err(e) => {
                error!(isolation = %isolation, repetition, error = %e, "Reset failed - aborting campaign");
                return Err(e);
            }
        }

        let batch = async { Ok(self.run_batch(isolation, deadline.token()).await) };
        let report = match deadline.bounded(batch).await {
            Ok(report) => report,
            Err(_) => {
                outcome.abandoned += 1;
                warn!(isolation = %isolation, repetition, "Batch abandoned after deadline grace");
                return Ok(());
            }
        };

        outcome.absorb(&report.stats);
        if (report.stats.transferred as i64) > self.campaign.max_affordable_transfers() {
            outcome.over_withdrawals += 1;
            debug!(
                isolation = %isolation,
                repetition,
                transferred = report.stats.transferred,
                affordable = self.campaign.max_affordable_transfers(),
                "Over-withdrawal: more transfers committed than the source could afford"
            );
        }
        if let Some(e) = report.connection_error {
            error!(isolation = %isolation, repetition, error = %e, "Connection lost - aborting campaign");
            return Err(e);
        }
        if let Some(e) = &report.first_error {
            outcome.batch_errors += 1;
            warn!(isolation = %isolation, repetition, code = e.code(), error = %e, "Batch stopped early");
        }

        match deadline.bounded(self.verifier.verify()).await {
            Ok(snapshot) => {
                debug!(
                    isolation = %isolation,
                    repetition,
                    source_balance = snapshot.source_balance,
                    dest_balance = snapshot.dest_balance,
                    "Repetition verified"
                );
            }
            Err(HarnessError::InvariantViolation {
                source_balance,
                dest_balance,
                ..
            }) => {
                outcome.invariant_violations += 1;
                outcome.violations.push(Violation {
                    repetition,
                    snapshot: BalanceSnapshot {
                        source_balance,
                        dest_balance,
                    },
                });
            }
            Err(e) if e.is_connection() => {
                error!(isolation = %isolation, repetition, error = %e, "Verification lost connection - aborting campaign");
                return Err(e);
            }
            Err(e) => {
                outcome.unverified += 1;
                warn!(isolation = %isolation, repetition, error = %e, "Verification did not complete");
            }
        }

        Ok(())
    }
}

fn log_outcome(outcome: &TestOutcome, affordable: i64) {
    info!(
        isolation = %outcome.isolation,
        repetitions = outcome.repetitions,
        attempted = outcome.attempted,
        committed = outcome.committed,
        transferred = outcome.transferred,
        insufficient_funds = outcome.insufficient_funds,
        conflicts = outcome.conflict_failures,
        cancelled = outcome.cancelled,
        failed = outcome.failed,
        over_withdrawals = outcome.over_withdrawals,
        affordable_per_batch = affordable,
        invariant_violations = outcome.invariant_violations,
        unverified = outcome.unverified,
        abandoned = outcome.abandoned,
        "Isolation level completed"
    );
    if outcome.invariant_violations > 0 {
        error!(
            isolation = %outcome.isolation,
            violations = outcome.invariant_violations,
            "Invariant violated under this isolation level"
        );
    }
}
