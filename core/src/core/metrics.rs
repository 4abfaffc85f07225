/// Per-interval tally of logical request outcomes.
///
/// `total` counts each logical request once, at its first attempt.
/// `success`/`failure` count each logical request once, at its terminal
/// outcome. Intermediate retry failures are never tallied, so
/// `success + failure <= total` holds at all times: requests still in
/// flight have been counted in `total` but not yet resolved.
///
/// All three counters sit behind one narrow mutex so the controller's
/// snapshot-and-reset can never lose an increment racing with it, nor
/// apply one to both the old and the new window.
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

impl WindowSnapshot {
    /// Fraction of resolved-failed requests over observed load. Zero when
    /// the window saw no traffic.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failure as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricsWindow {
    counts: Mutex<WindowSnapshot>,
}

impl MetricsWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called exactly once per logical request, at its first attempt.
    pub fn record_attempt_start(&self) {
        self.lock().total += 1;
    }

    /// Called exactly once per logical request, at its terminal outcome.
    pub fn record_outcome(&self, success: bool) {
        let mut counts = self.lock();
        if success {
            counts.success += 1;
        } else {
            counts.failure += 1;
        }
    }

    /// Returns the current window and replaces it with a zeroed one.
    pub fn snapshot_and_reset(&self) -> WindowSnapshot {
        std::mem::take(&mut *self.lock())
    }

    /// Read without resetting. Dashboard use only.
    pub fn peek(&self) -> WindowSnapshot {
        *self.lock()
    }

    // A poisoned lock would mean a panic mid-increment; the counters are
    // plain integers, so the state is still coherent. Keep counting.
    fn lock(&self) -> MutexGuard<'_, WindowSnapshot> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
