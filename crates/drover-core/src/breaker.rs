//! Circuit breaker over consecutive task failures.
//!
//! A streak of failures across the whole plan opens the breaker for a
//! cooldown period during which no new tasks are spawned. Any task success
//! closes it and clears the streak.

use std::time::{Duration, Instant};

/// Default consecutive-failure threshold.
pub const DEFAULT_THRESHOLD: u32 = 3;

/// Default cooldown once the breaker opens.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Opens since the last success; two in a row means cooling down did
    /// not help and the orchestrator should give up.
    opens_since_success: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            consecutive_failures: 0,
            opened_at: None,
            opens_since_success: 0,
        }
    }

    /// Record a task failure. Returns `true` when this failure opened the
    /// breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold && self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
            self.opens_since_success += 1;
            tracing::warn!(
                failures = self.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit breaker opened"
            );
            return true;
        }
        false
    }

    /// Record a task success: close the breaker and clear the streak.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.opens_since_success = 0;
    }

    /// Whether the breaker currently blocks new task spawns.
    pub fn is_open(&self) -> bool {
        self.remaining_cooldown().is_some()
    }

    /// Time left in the cooldown, if the breaker is open.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let opened_at = self.opened_at?;
        let elapsed = opened_at.elapsed();
        if elapsed < self.cooldown {
            Some(self.cooldown - elapsed)
        } else {
            None
        }
    }

    /// Acknowledge the end of a cooldown period: the breaker allows one more
    /// round of work, but stays armed until a success lands.
    pub fn end_cooldown(&mut self) {
        self.opened_at = None;
        self.consecutive_failures = 0;
    }

    /// True when the breaker has opened twice without an intervening
    /// success; continuing is pointless.
    pub fn exhausted(&self) -> bool {
        self.opens_since_success >= 2
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
    }

    #[test]
    fn success_resets_the_streak() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        assert!(!breaker.record_failure());
        assert!(!breaker.is_open());
    }

    #[test]
    fn cooldown_expires() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        assert!(breaker.record_failure());
        assert!(breaker.is_open());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!breaker.is_open());
    }

    #[test]
    fn two_opens_without_success_exhaust() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(1));
        breaker.record_failure();
        assert!(!breaker.exhausted());
        breaker.end_cooldown();
        breaker.record_failure();
        assert!(breaker.exhausted());

        breaker.record_success();
        assert!(!breaker.exhausted());
    }
}
