/// Adaptive retry feedback loop.
///
/// Once per window the controller consumes the metrics tally, projects the
/// load a fixed retry policy would generate, and when that projection
/// exceeds the backend's safety capacity solves for the largest retry count
/// that stays under it. The decision is a pure function of the observed
/// window and the configuration; no history or hysteresis is kept, so the
/// budget may oscillate at the stability boundary between windows.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::core::budget::RetryBudget;
use crate::core::metrics::{MetricsWindow, WindowSnapshot};
use crate::{GatewayConfig, SinkRef};

const SEPARATOR: &str = "──────────────────────────────────────────────────";

/// Outcome of one control tick, kept for the state endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlDecision {
    /// Logical requests observed during the window (L).
    pub load: u64,
    /// Fraction of those that terminally failed (P).
    pub failure_rate: f64,
    /// Load the backend would see if every request used the standard policy.
    pub projected_load: f64,
    /// Retry budget committed for the next window.
    pub budget: u32,
    pub stable: bool,
}

/// Computes the next retry budget from one window's tally.
///
/// Returns `None` on a zero-traffic window: no signal, the current budget
/// is retained. Otherwise the projection `L * (1 + P * multiplier)` is
/// compared against the capacity estimate; while it fits, the standard
/// policy is restored outright. Past capacity, the linear relation
/// `L * (1 + P * k) <= C` is solved for the largest integer `k`, clamped
/// into `[0, max_retries]`. A failure-free window that still exceeds
/// capacity means retries cannot help: the budget drops to zero.
pub fn plan_budget(window: WindowSnapshot, config: &GatewayConfig) -> Option<ControlDecision> {
    if window.total == 0 {
        return None;
    }

    let load = window.total;
    let observed = load as f64;
    let failure_rate = window.failure as f64 / observed;
    let capacity = f64::from(config.capacity_estimate);
    let projected_load =
        observed * (1.0 + failure_rate * f64::from(config.standard_retry_multiplier));

    if projected_load <= capacity {
        return Some(ControlDecision {
            load,
            failure_rate,
            projected_load,
            budget: config.max_retries,
            stable: true,
        });
    }

    let budget = if failure_rate == 0.0 {
        0
    } else {
        let optimal = (capacity / observed - 1.0) / failure_rate;
        optimal.floor().clamp(0.0, f64::from(config.max_retries)) as u32
    };

    Some(ControlDecision {
        load,
        failure_rate,
        projected_load,
        budget,
        stable: false,
    })
}

/// Shared cell holding the most recent control decision.
#[derive(Debug, Default)]
pub struct DecisionCell(Mutex<Option<ControlDecision>>);

impl DecisionCell {
    pub fn store(&self, decision: ControlDecision) {
        *self.lock() = Some(decision);
    }

    pub fn get(&self) -> Option<ControlDecision> {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ControlDecision>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct FeedbackController {
    config: GatewayConfig,
    metrics: Arc<MetricsWindow>,
    budget: Arc<RetryBudget>,
    last_decision: Arc<DecisionCell>,
    sink: SinkRef,
}

impl FeedbackController {
    pub fn new(
        config: GatewayConfig,
        metrics: Arc<MetricsWindow>,
        budget: Arc<RetryBudget>,
        last_decision: Arc<DecisionCell>,
        sink: SinkRef,
    ) -> Self {
        Self {
            config,
            metrics,
            budget,
            last_decision,
            sink,
        }
    }

    /// One control cycle: consume the window, recompute, commit.
    pub fn tick(&self) {
        let window = self.metrics.snapshot_and_reset();
        let Some(decision) = plan_budget(window, &self.config) else {
            debug!("zero-traffic window, budget retained at {}", self.budget.get());
            return;
        };

        let previous = self.budget.get();
        self.budget.set(decision.budget);
        self.last_decision.store(decision);
        self.report(previous, &decision);
    }

    fn report(&self, previous: u32, decision: &ControlDecision) {
        self.sink.on_log("dim", SEPARATOR);
        self.sink.on_log(
            "phase",
            &format!(
                "[*] Gateway telemetry: load {}/window, failure rate {:.0}%",
                decision.load,
                decision.failure_rate * 100.0
            ),
        );

        if decision.stable {
            self.sink.on_log(
                "success",
                &format!(
                    "[+] System stable. Standard retry policy ({}x) active.",
                    self.config.max_retries
                ),
            );
        } else {
            self.sink.on_log(
                "warn",
                &format!(
                    "[!] Stability warning: standard retries would project {:.0} req/window (capacity {})",
                    decision.projected_load, self.config.capacity_estimate
                ),
            );
            if previous != decision.budget {
                self.sink.on_log(
                    "error",
                    &format!(
                        "[!] Adaptive action: reducing retries {} -> {}",
                        previous, decision.budget
                    ),
                );
            } else {
                self.sink
                    .on_log("warn", &format!("[+] Retries held at {}", decision.budget));
            }
        }
        self.sink.on_log("dim", SEPARATOR);
    }

    /// Periodic driver. Runs until the shutdown channel flips or closes.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.window_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first interval tick fires immediately; the window is empty at
        // that point so the tick is a no-op.
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("feedback controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NullSink;
    use std::time::Duration;

    fn config() -> GatewayConfig {
        GatewayConfig::default()
    }

    fn window(total: u64, failure: u64) -> WindowSnapshot {
        WindowSnapshot {
            total,
            success: total - failure,
            failure,
        }
    }

    #[test]
    fn baseline_load_keeps_standard_policy() {
        // L=20, P=0, C=50: projected 20 <= 50.
        let decision = plan_budget(window(20, 0), &config()).unwrap();
        assert!(decision.stable);
        assert_eq!(decision.budget, 3);
        assert_eq!(decision.projected_load, 20.0);
    }

    #[test]
    fn boundary_projection_counts_as_stable() {
        // L=20, P=0.5: projected exactly 50, not greater than capacity.
        let decision = plan_budget(window(20, 10), &config()).unwrap();
        assert!(decision.stable);
        assert_eq!(decision.budget, 3);
        assert_eq!(decision.projected_load, 50.0);
    }

    #[test]
    fn critical_failure_shrinks_budget() {
        // L=20, P=0.8: projected 68 > 50, optimal k = 1.875 -> 1.
        let decision = plan_budget(window(20, 16), &config()).unwrap();
        assert!(!decision.stable);
        assert_eq!(decision.budget, 1);
    }

    #[test]
    fn overload_with_high_failure_forbids_retries() {
        // L=60 > C=50 with P=0.9: optimal k negative, clamps to 0.
        let decision = plan_budget(window(60, 54), &config()).unwrap();
        assert!(!decision.stable);
        assert_eq!(decision.budget, 0);
    }

    #[test]
    fn overload_without_failures_forbids_retries() {
        // P=0 but L alone exceeds capacity: retries cannot help.
        let decision = plan_budget(window(80, 0), &config()).unwrap();
        assert!(!decision.stable);
        assert_eq!(decision.budget, 0);
    }

    #[test]
    fn zero_traffic_window_yields_no_decision() {
        assert!(plan_budget(window(0, 0), &config()).is_none());
    }

    #[test]
    fn decision_is_deterministic() {
        let first = plan_budget(window(20, 16), &config()).unwrap();
        let second = plan_budget(window(20, 16), &config()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn budget_always_within_bounds() {
        let config = config();
        for total in 1..=120u64 {
            for failure in 0..=total {
                let decision = plan_budget(window(total, failure), &config).unwrap();
                assert!(decision.budget <= config.max_retries);
            }
        }
    }

    #[test]
    fn tick_commits_budget_and_decision() {
        let config = config();
        let metrics = Arc::new(MetricsWindow::new());
        let budget = Arc::new(RetryBudget::new(config.max_retries, config.max_retries));
        let cell = Arc::new(DecisionCell::default());
        let controller = FeedbackController::new(
            config,
            Arc::clone(&metrics),
            Arc::clone(&budget),
            Arc::clone(&cell),
            NullSink::new_ref(),
        );

        // 20 logical requests, 16 terminal failures.
        for i in 0..20 {
            metrics.record_attempt_start();
            metrics.record_outcome(i >= 16);
        }
        controller.tick();

        assert_eq!(budget.get(), 1);
        let decision = cell.get().unwrap();
        assert_eq!(decision.load, 20);
        assert!(!decision.stable);

        // The window was consumed by the tick.
        assert_eq!(metrics.peek(), WindowSnapshot::default());
    }

    #[test]
    fn zero_traffic_tick_retains_budget() {
        let config = config();
        let metrics = Arc::new(MetricsWindow::new());
        let budget = Arc::new(RetryBudget::new(2, config.max_retries));
        let controller = FeedbackController::new(
            config,
            Arc::clone(&metrics),
            Arc::clone(&budget),
            Arc::new(DecisionCell::default()),
            NullSink::new_ref(),
        );

        controller.tick();
        assert_eq!(budget.get(), 2);
    }

    #[tokio::test]
    async fn run_loop_ticks_and_shuts_down() {
        let config = GatewayConfig {
            window_ms: 20,
            ..GatewayConfig::default()
        };
        let metrics = Arc::new(MetricsWindow::new());
        let budget = Arc::new(RetryBudget::new(3, 3));
        let cell = Arc::new(DecisionCell::default());
        let controller = FeedbackController::new(
            config,
            Arc::clone(&metrics),
            Arc::clone(&budget),
            Arc::clone(&cell),
            NullSink::new_ref(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));

        for _ in 0..10 {
            metrics.record_attempt_start();
            metrics.record_outcome(true);
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cell.get().is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("controller did not stop on shutdown")
            .unwrap();
    }
}
