//! Retry pacing for failed bootstrap writes

use std::time::Duration;

use tokio::time::Instant;

use crate::config::BackoffConfig;

/// Exponential backoff with jitter.
///
/// Each consecutive failure multiplies the delay by `multiplier`, capped at
/// `max_delay`, and adds up to 10% jitter. A success resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    delay: Option<Duration>,
    retry_at: Option<Instant>,
    failures: u32,
}

impl Backoff {
    /// Create a backoff in the reset state
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            delay: None,
            retry_at: None,
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt
    pub fn record_failure(&mut self) -> Duration {
        let base = match self.delay {
            None => self.config.initial_delay.min(self.config.max_delay),
            Some(delay) => self.scaled(delay, self.config.multiplier),
        };
        self.delay = Some(base);
        self.failures = self.failures.saturating_add(1);

        let jittered = self.scaled(base, rand::random::<f64>().mul_add(0.1, 1.0));
        // An unrepresentable deadline leaves the retry unpaced
        self.retry_at = Instant::now().checked_add(jittered);
        jittered
    }

    /// `delay * factor`, saturating at `max_delay`
    fn scaled(&self, delay: Duration, factor: f64) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    /// Forget previous failures
    pub fn reset(&mut self) {
        self.delay = None;
        self.retry_at = None;
        self.failures = 0;
    }

    /// Whether an attempt may be made now
    pub fn ready(&self) -> bool {
        self.retry_at.is_none_or(|at| Instant::now() >= at)
    }

    /// When the next attempt is allowed, if a failure is pending
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Drop the pending retry deadline once it has been acted on; the delay
    /// keeps growing on the next failure
    pub fn clear_retry(&mut self) {
        self.retry_at = None;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
