//! Retry Backoff
//!
//! Exponential backoff with jitter between provider call attempts.

use std::time::Duration;

use rand::Rng;

/// Retry configuration for provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Same settings without jitter.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// Backoff state for the retries of one call.
///
/// # Example
///
/// ```rust
/// use price_stream::application::services::backoff::{BackoffPolicy, RetryConfig};
/// use std::time::Duration;
///
/// let mut policy = BackoffPolicy::new(RetryConfig {
///     max_retries: 2,
///     ..RetryConfig::default().without_jitter()
/// });
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(300)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(600)));
/// assert_eq!(policy.next_delay(), None);
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: RetryConfig,
    current: Duration,
    retries: u32,
}

impl BackoffPolicy {
    /// Start a fresh policy.
    #[must_use]
    pub const fn new(config: RetryConfig) -> Self {
        let current = config.initial_backoff;
        Self {
            config,
            current,
            retries: 0,
        }
    }

    /// Delay before the next retry, or `None` once retries are used up.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }
        self.retries += 1;

        let delay = self.jittered(self.current);
        self.current = self.grow(self.current);

        Some(delay)
    }

    /// Retries handed out so far.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn grow(&self, delay: Duration) -> Duration {
        let max_millis = self.config.max_backoff.as_millis() as f64;
        let grown = (delay.as_millis() as f64 * self.config.multiplier).round();
        if !grown.is_finite() {
            return self.config.max_backoff;
        }
        Duration::from_millis(grown.clamp(0.0, max_millis) as u64)
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        let base = delay.as_millis() as f64;
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::from_millis((base + offset).max(1.0) as u64)
    }
}
