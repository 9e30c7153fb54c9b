//! Retry backoff policy
//!
//! The router re-selects an instance between attempts, so backoff is a
//! standalone delay computation rather than a retry combinator: exponential
//! doubling from a base, capped, with ±25 % jitter to avoid thundering
//! herds across concurrent requests.

use std::time::Duration;

use rand::RngExt;

use crate::config::{BackoffConfig, RouterConfig};

/// Jitter applied around the nominal delay
const JITTER_FRACTION: f64 = 0.25;

/// Retry policy for the dispatch loop
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff
    pub base: Duration,
    /// Backoff ceiling
    pub max: Duration,
}

impl RetryPolicy {
    /// Create from router configuration
    #[must_use]
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.backoff.base,
            max: config.backoff.max,
        }
    }

    /// Create from backoff bounds with an explicit retry budget
    #[must_use]
    pub fn with_backoff(max_retries: u32, backoff: &BackoffConfig) -> Self {
        Self {
            max_retries,
            base: backoff.base,
            max: backoff.max,
        }
    }

    /// Jittered delay before retry number `attempt` (1-based):
    /// `base * 2^(attempt-1)` capped at `max`, then ±25 % jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let nominal = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);

        let jitter: f64 = rand::rng().random_range(-JITTER_FRACTION..=JITTER_FRACTION);
        nominal.mul_f64(1.0 + jitter)
    }

    /// Whether another retry is allowed after `attempt` completed attempts
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}
