//! Circuit breaker for the seeding jobs.
//!
//! Opens after a number of consecutive failures, stays open for a cooldown
//! during which the guarded job is a no-op, and closes automatically once
//! the cooldown expires. Owned by a single scheduler task, so no locking.

use std::time::{Duration, Instant};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 4;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// True while the breaker is open. An expired cooldown closes it as a
    /// side effect, so the next check reports closed.
    pub fn is_open(&mut self) -> bool {
        match self.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.open_until = None;
                self.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failure; the breaker opens when the consecutive run reaches
    /// the threshold.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.open_until = Some(Instant::now() + self.cooldown);
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let mut b = CircuitBreaker::new(4, Duration::from_secs(300));
        for _ in 0..3 {
            b.record_failure();
            assert!(!b.is_open());
        }
        b.record_failure();
        assert!(b.is_open());
    }

    #[test]
    fn success_resets_the_failure_run() {
        let mut b = CircuitBreaker::new(4, Duration::from_secs(300));
        for _ in 0..3 {
            b.record_failure();
        }
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
        b.record_failure();
        assert!(!b.is_open());
    }

    #[test]
    fn closes_once_cooldown_expires() {
        let mut b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.record_failure();
        // zero cooldown: open_until is already in the past
        assert!(!b.is_open());
        assert_eq!(b.consecutive_failures(), 0);
    }
}
