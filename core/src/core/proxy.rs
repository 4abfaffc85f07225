/// Retry-bounded proxy execution.
///
/// One `execute` call is one logical request: an explicit bounded loop of
/// backend attempts, never recursion. The retry budget is re-read on every
/// failed attempt, so a reduction committed mid-flight by the controller
/// applies to this request's next retry; attempts already made are not
/// aborted. The attempt counter is additionally capped by `max_retries`,
/// so no logical request issues more than `max_retries + 1` backend calls
/// whatever the budget's history.
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::core::budget::RetryBudget;
use crate::core::metrics::MetricsWindow;
use crate::http::{AttemptError, BackendCall};

/// Terminal failure of a logical request: every permitted attempt failed.
#[derive(Debug)]
pub struct Unavailable {
    pub attempts: u32,
    pub last_error: AttemptError,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unavailable after {} attempt(s): {}",
            self.attempts, self.last_error
        )
    }
}

impl std::error::Error for Unavailable {}

pub struct ProxyExecutor {
    backend: Arc<dyn BackendCall>,
    metrics: Arc<MetricsWindow>,
    budget: Arc<RetryBudget>,
    max_retries: u32,
}

impl ProxyExecutor {
    pub fn new(
        backend: Arc<dyn BackendCall>,
        metrics: Arc<MetricsWindow>,
        budget: Arc<RetryBudget>,
        max_retries: u32,
    ) -> Self {
        Self {
            backend,
            metrics,
            budget,
            max_retries,
        }
    }

    /// Runs one logical request to its terminal outcome.
    pub async fn execute(&self) -> Result<(), Unavailable> {
        self.metrics.record_attempt_start();

        let mut attempt: u32 = 0;
        loop {
            match self.backend.call().await {
                Ok(()) => {
                    self.metrics.record_outcome(true);
                    return Ok(());
                }
                Err(err) => {
                    // Fresh read each attempt: the controller may have
                    // committed a new budget since the last one.
                    let allowed = self.budget.get().min(self.max_retries);
                    if attempt < allowed {
                        attempt += 1;
                        debug!("attempt {} failed ({}), retrying", attempt, err);
                        continue;
                    }

                    self.metrics.record_outcome(false);
                    return Err(Unavailable {
                        attempts: attempt + 1,
                        last_error: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

    /// Scripted backend: fails the first `fail_first` calls, then succeeds.
    /// Optionally commits a new budget value after the first call, standing
    /// in for a controller tick landing mid-flight.
    struct ScriptedBackend {
        calls: AtomicU64,
        fail_first: u64,
        budget_after_first_call: Option<(Arc<RetryBudget>, u32)>,
    }

    impl ScriptedBackend {
        fn failing(fail_first: u64) -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail_first,
                budget_after_first_call: None,
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Relaxed)
        }
    }

    #[async_trait]
    impl BackendCall for ScriptedBackend {
        async fn call(&self) -> Result<(), AttemptError> {
            let call_index = self.calls.fetch_add(1, Relaxed);
            if call_index == 0 {
                if let Some((budget, value)) = &self.budget_after_first_call {
                    budget.set(*value);
                }
            }
            if call_index < self.fail_first {
                Err(AttemptError::Status(500))
            } else {
                Ok(())
            }
        }
    }

    fn executor(
        backend: Arc<ScriptedBackend>,
        budget: Arc<RetryBudget>,
        max_retries: u32,
    ) -> (ProxyExecutor, Arc<MetricsWindow>) {
        let metrics = Arc::new(MetricsWindow::new());
        let executor = ProxyExecutor::new(backend, Arc::clone(&metrics), budget, max_retries);
        (executor, metrics)
    }

    #[tokio::test]
    async fn first_try_success_makes_one_call() {
        let backend = Arc::new(ScriptedBackend::failing(0));
        let budget = Arc::new(RetryBudget::new(3, 3));
        let (executor, metrics) = executor(Arc::clone(&backend), budget, 3);

        executor.execute().await.unwrap();

        assert_eq!(backend.calls(), 1);
        let snap = metrics.snapshot_and_reset();
        assert_eq!((snap.total, snap.success, snap.failure), (1, 1, 0));
    }

    #[tokio::test]
    async fn recovers_within_budget() {
        let backend = Arc::new(ScriptedBackend::failing(2));
        let budget = Arc::new(RetryBudget::new(3, 3));
        let (executor, metrics) = executor(Arc::clone(&backend), budget, 3);

        executor.execute().await.unwrap();

        assert_eq!(backend.calls(), 3);
        let snap = metrics.snapshot_and_reset();
        assert_eq!((snap.total, snap.success, snap.failure), (1, 1, 0));
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_unavailable() {
        let backend = Arc::new(ScriptedBackend::failing(u64::MAX));
        let budget = Arc::new(RetryBudget::new(3, 3));
        let (executor, metrics) = executor(Arc::clone(&backend), budget, 3);

        let err = executor.execute().await.unwrap_err();

        // Budget 3 permits 1 + 3 calls.
        assert_eq!(backend.calls(), 4);
        assert_eq!(err.attempts, 4);
        let snap = metrics.snapshot_and_reset();
        assert_eq!((snap.total, snap.success, snap.failure), (1, 0, 1));
    }

    #[tokio::test]
    async fn zero_budget_means_single_attempt() {
        let backend = Arc::new(ScriptedBackend::failing(u64::MAX));
        let budget = Arc::new(RetryBudget::new(0, 3));
        let (executor, _metrics) = executor(Arc::clone(&backend), budget, 3);

        let err = executor.execute().await.unwrap_err();
        assert_eq!(backend.calls(), 1);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn executor_cap_overrides_larger_budget() {
        // A budget object with a wider bound than the executor's own cap:
        // the executor still stops at max_retries + 1 calls.
        let backend = Arc::new(ScriptedBackend::failing(u64::MAX));
        let budget = Arc::new(RetryBudget::new(10, 10));
        let (executor, _metrics) = executor(Arc::clone(&backend), budget, 3);

        executor.execute().await.unwrap_err();
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test]
    async fn budget_reduction_applies_to_next_retry() {
        // Controller commits budget 0 while the first attempt is in flight:
        // the request gets no further retries.
        let budget = Arc::new(RetryBudget::new(3, 3));
        let backend = Arc::new(ScriptedBackend {
            calls: AtomicU64::new(0),
            fail_first: u64::MAX,
            budget_after_first_call: Some((Arc::clone(&budget), 0)),
        });
        let (executor, _metrics) = executor(Arc::clone(&backend), Arc::clone(&budget), 3);

        let err = executor.execute().await.unwrap_err();
        assert_eq!(backend.calls(), 1);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn intermediate_failures_are_not_tallied() {
        let backend = Arc::new(ScriptedBackend::failing(3));
        let budget = Arc::new(RetryBudget::new(3, 3));
        let (executor, metrics) = executor(Arc::clone(&backend), budget, 3);

        executor.execute().await.unwrap();

        // Three failed attempts preceded the success, but the window sees
        // exactly one logical request with one terminal success.
        let snap = metrics.snapshot_and_reset();
        assert_eq!((snap.total, snap.success, snap.failure), (1, 1, 0));
    }
}
