/// Shared retry allowance for the proxy executor.
///
/// Single writer (the feedback controller, once per window), many readers
/// (every retry decision). A plain atomic keeps the hot path lock-free;
/// readers may observe the previous or the newly committed value, never a
/// torn one. Stores clamp to `[0, max_retries]` so a misconfigured caller
/// cannot widen the bound.
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

#[derive(Debug)]
pub struct RetryBudget {
    allowed: AtomicU32,
    max_retries: u32,
}

impl RetryBudget {
    pub fn new(initial: u32, max_retries: u32) -> Self {
        Self {
            allowed: AtomicU32::new(initial.min(max_retries)),
            max_retries,
        }
    }

    /// Current number of retries permitted per logical request.
    pub fn get(&self) -> u32 {
        self.allowed.load(Relaxed)
    }

    pub fn set(&self, retries: u32) {
        self.allowed.store(retries.min(self.max_retries), Relaxed);
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_value_is_clamped() {
        let budget = RetryBudget::new(10, 3);
        assert_eq!(budget.get(), 3);
    }

    #[test]
    fn set_clamps_to_max() {
        let budget = RetryBudget::new(3, 3);
        budget.set(7);
        assert_eq!(budget.get(), 3);
        budget.set(0);
        assert_eq!(budget.get(), 0);
        budget.set(2);
        assert_eq!(budget.get(), 2);
    }
}
