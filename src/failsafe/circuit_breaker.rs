//! Circuit breaker implementation
//!
//! One breaker guards dispatch to one `(tool, instance)` pair. Reads are
//! lock-free where possible; writes are serialized per cell. A lost update
//! between two racing failures is tolerated — the threshold may be crossed
//! with at most one extra failure.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::BreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (one probe allowed to test recovery)
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in logs and error payloads
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// What a dispatcher may do with this breaker right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerView {
    /// Closed: dispatch freely
    Dispatchable,
    /// Open and still cooling down: skip this instance
    Cooling,
    /// Open past its cooldown, or half-open with no probe in flight:
    /// a single probe may be admitted via [`CircuitBreaker::try_begin_probe`]
    ProbeEligible {
        /// Epoch-ms of the last dispatch attempt, for least-recently-tried
        /// ordering across candidates
        last_attempt_ms: u64,
    },
}

/// Circuit breaker for one `(tool, instance)` pair
pub struct CircuitBreaker {
    /// `tool@instance` label for logs
    key: String,
    failure_threshold: u32,
    cooldown: Duration,
    /// State
    state: RwLock<CircuitState>,
    /// Consecutive failure count
    failures: AtomicU32,
    /// Epoch-ms of the last Closed->Open transition (0 = never opened)
    opened_at_ms: AtomicU64,
    /// Whether a half-open probe is currently in flight
    probe_in_flight: AtomicBool,
    /// Epoch-ms of the last dispatch attempt through this breaker
    last_attempt_ms: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new breaker for a `(tool, instance)` pair
    #[must_use]
    pub fn new(tool: &str, instance: &str, config: &BreakerConfig) -> Self {
        Self {
            key: format!("{tool}@{instance}"),
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
            state: RwLock::new(CircuitState::Closed),
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            last_attempt_ms: AtomicU64::new(0),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Current consecutive failure count
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// How the dispatcher should treat this breaker right now
    #[must_use]
    pub fn view(&self) -> BreakerView {
        match *self.state.read() {
            CircuitState::Closed => BreakerView::Dispatchable,
            CircuitState::HalfOpen => {
                if self.probe_in_flight.load(Ordering::Acquire) {
                    BreakerView::Cooling
                } else {
                    BreakerView::ProbeEligible {
                        last_attempt_ms: self.last_attempt_ms.load(Ordering::Relaxed),
                    }
                }
            }
            CircuitState::Open => {
                if self.cooldown_elapsed() {
                    BreakerView::ProbeEligible {
                        last_attempt_ms: self.last_attempt_ms.load(Ordering::Relaxed),
                    }
                } else {
                    BreakerView::Cooling
                }
            }
        }
    }

    /// Try to claim the single half-open probe slot.
    ///
    /// Succeeds only when the circuit is open past its cooldown or already
    /// half-open with no probe in flight; on success the circuit is
    /// `HalfOpen` and the caller owns the probe until it records an outcome.
    pub fn try_begin_probe(&self) -> bool {
        let state = *self.state.read();
        let eligible = match state {
            CircuitState::HalfOpen => true,
            CircuitState::Open => self.cooldown_elapsed(),
            CircuitState::Closed => false,
        };
        if !eligible {
            return false;
        }
        if self
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.transition_to(CircuitState::HalfOpen);
        debug!(breaker = %self.key, "Half-open probe admitted");
        true
    }

    /// Note a dispatch attempt, for least-recently-tried ordering
    pub fn touch_attempt(&self) {
        self.last_attempt_ms
            .store(epoch_millis_now(), Ordering::Relaxed);
    }

    /// Record a successful call: resets the failure count; a half-open
    /// probe success closes the circuit.
    pub fn record_success(&self) {
        let state = *self.state.read();
        self.probe_in_flight.store(false, Ordering::Release);
        match state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                debug!(breaker = %self.key, "Probe succeeded, closing circuit");
                self.transition_to(CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a retryable call failure: opens the circuit at the threshold;
    /// a half-open probe failure re-opens and restarts the cooldown.
    pub fn record_failure(&self) {
        let state = *self.state.read();
        self.probe_in_flight.store(false, Ordering::Release);
        match state {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    warn!(breaker = %self.key, failures, "Failure threshold reached, opening circuit");
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.key, "Probe failed, reopening circuit");
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a cancelled call: counts as neither success nor failure, but
    /// releases the probe slot so recovery is not wedged.
    pub fn record_cancelled(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
    }

    fn cooldown_elapsed(&self) -> bool {
        let opened = self.opened_at_ms.load(Ordering::Relaxed);
        if opened == 0 {
            return true;
        }
        let elapsed = epoch_millis_now().saturating_sub(opened);
        #[allow(clippy::cast_possible_truncation)]
        let cooldown_ms = self.cooldown.as_millis() as u64;
        elapsed >= cooldown_ms
    }

    fn transition_to(&self, new_state: CircuitState) {
        let mut state = self.state.write();
        let old_state = *state;
        if old_state == new_state {
            // Re-opening from HalfOpen still restarts the cooldown below.
            if new_state != CircuitState::Open {
                return;
            }
        }
        *state = new_state;
        match new_state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
                self.opened_at_ms.store(0, Ordering::Relaxed);
                debug!(breaker = %self.key, "Circuit closed");
            }
            CircuitState::Open => {
                self.opened_at_ms.store(epoch_millis_now(), Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {}
        }
    }
}

/// Current time as milliseconds since UNIX epoch.
///
/// Truncation to `u64` is safe: epoch-ms fits comfortably for centuries.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn epoch_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
