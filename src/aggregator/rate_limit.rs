//! Per-provider token buckets
//!
//! Refill is lazy: tokens accrue proportionally to elapsed time on each
//! access, clamped at capacity. Updates are serialized under a mutex so a
//! concurrent race can only under-count available tokens, never over-count
//! — the conservative side of the rate-limit invariant.

use std::time::Instant;

use parking_lot::Mutex;

use crate::config::ProviderRateLimit;

/// Token bucket for one provider
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    #[must_use]
    pub fn new(limit: &ProviderRateLimit) -> Self {
        let capacity = f64::from(limit.capacity);
        Self {
            capacity,
            refill_per_second: limit.refill_per_second.max(0.0),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token. Returns `false` when the bucket is empty, in
    /// which case the caller treats the provider as rate-limited without
    /// calling upstream.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after a lazy refill)
    #[must_use]
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_second).min(self.capacity);
        state.last_refill = now;
        state.tokens
    }

    /// Backdate the last refill, as if `seconds` had elapsed untouched
    #[cfg(test)]
    pub(crate) fn backdate(&self, seconds: f64) {
        let mut state = self.state.lock();
        state.last_refill = Instant::now() - std::time::Duration::from_secs_f64(seconds);
    }
}
