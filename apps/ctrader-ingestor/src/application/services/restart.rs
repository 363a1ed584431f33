//! Session Restart Policy
//!
//! The protocol client never reconnects on its own. The ingestor binary
//! owns that decision and spaces attempts with exponential backoff plus
//! jitter, so a broker outage does not turn into a reconnect storm.

use std::time::Duration;

use rand::Rng;

/// Backoff settings for restarting a dropped session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartConfig {
    /// Delay before the first restart.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Randomisation as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Give up after this many consecutive failures (0 = never).
    pub max_attempts: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

/// Exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use ctrader_ingestor::application::services::{RestartConfig, RestartPolicy};
///
/// let mut policy = RestartPolicy::new(RestartConfig::default());
/// assert!(policy.next_delay().is_some());
///
/// // the session came back up
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct RestartPolicy {
    config: RestartConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl RestartPolicy {
    /// Create a policy at its initial delay.
    #[must_use]
    pub const fn new(config: RestartConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.jittered(self.current_delay);
        self.current_delay = self
            .current_delay
            .mul_f64(self.config.multiplier.max(1.0))
            .min(self.config.max_delay);

        Some(delay)
    }

    /// Back to the initial delay after a session reached `Ready`.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Consecutive failed attempts so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        let factor = rand::rng().random_range(-self.config.jitter_factor..=self.config.jitter_factor);
        delay.mul_f64((1.0 + factor).max(0.0)).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial_ms: u64, max_ms: u64, max_attempts: u32) -> RestartConfig {
        RestartConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn test_delays_double_until_capped() {
        let mut policy = RestartPolicy::new(fixed(100, 500, 0));

        let delays: Vec<u128> = (0..5)
            .map(|_| policy.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_max_attempts_stops_retrying() {
        let mut policy = RestartPolicy::new(fixed(10, 100, 2));

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut policy = RestartPolicy::new(fixed(10, 1_000, 3));
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..100 {
            let mut policy = RestartPolicy::new(RestartConfig {
                initial_delay: Duration::from_secs(1),
                ..RestartConfig::default()
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }
}
