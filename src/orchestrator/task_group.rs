//! Bounded Task Group
//!
//! Spawns work onto the tokio runtime, lets at most `limit` items run at
//! once, and exposes a single join point:
//!
//! - every spawned task reaches a terminal result before `join` returns
//! - the first fatal error cancels the group token so siblings abort early
//! - benign errors (conflicts) and cancellations never cancel siblings
//! - a panicking task is reported as [`HarnessError::TaskPanicked`]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::HarnessError;

/// Decrements the in-flight gauge even when the task unwinds
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(gauge: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(gauge))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a joined group produced
#[derive(Debug)]
pub struct GroupOutcome<T> {
    /// One entry per spawned task, in completion order
    pub results: Vec<Result<T, HarnessError>>,
    /// First fatal error observed, if any
    pub first_error: Option<HarnessError>,
    /// Highest number of tasks that held a permit at the same time
    pub peak_in_flight: usize,
}

pub struct TaskGroup<T> {
    join_set: JoinSet<Result<T, HarnessError>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Group running at most `limit` tasks at once under `cancel`
    pub fn new(limit: usize, cancel: CancellationToken) -> Self {
        Self {
            join_set: JoinSet::new(),
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            cancel,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Token shared by every task of the group
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Queue one task. `make` receives the group token and builds the work;
    /// the work only starts once a permit is free.
    pub fn spawn<F, Fut>(&mut self, make: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, HarnessError>> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        let cancel = self.cancel.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let peak = Arc::clone(&self.peak);

        self.join_set.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                permit = semaphore.acquire_owned() => permit
                    .map_err(|_| HarnessError::Store("task group semaphore closed".to_string()))?,
            };
            let _gauge = InFlight::enter(&in_flight, &peak);
            make(cancel).await
        });
    }

    /// Wait for every task. Cancels the group on the first fatal error.
    pub async fn join(mut self) -> GroupOutcome<T> {
        let mut results = Vec::with_capacity(self.join_set.len());
        let mut first_error: Option<HarnessError> = None;

        while let Some(joined) = self.join_set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    let payload = join_err.into_panic();
                    let message = if let Some(&message) = payload.downcast_ref::<&str>() {
                        message.to_string()
                    } else if let Some(message) = payload.downcast_ref::<String>() {
                        message.clone()
                    } else {
                        "Unknown panic payload".to_string()
                    };
                    Err(HarnessError::TaskPanicked(message))
                }
                Err(_) => Err(HarnessError::Cancelled),
            };

            if let Err(e) = &result
                && e.is_fatal()
                && first_error.is_none()
            {
                error!(code = e.code(), error = %e, "Fatal task error - cancelling group");
                first_error = Some(e.clone());
                self.cancel.cancel();
            }
            results.push(result);
        }

        let peak_in_flight = self.peak.load(Ordering::SeqCst);
        debug!(
            tasks = results.len(),
            peak_in_flight,
            failed = first_error.is_some(),
            "Task group joined"
        );

        GroupOutcome {
            results,
            first_error,
            peak_in_flight,
        }
    }
}
