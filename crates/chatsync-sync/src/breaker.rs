//! Circuit breaker, exponential backoff and channel health.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, BreakerConfig};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Refusing fetch attempts until the cool-down elapses.
    Open,
    /// Cool-down elapsed; the next attempt decides.
    HalfOpen,
}

/// Engine-wide breaker around ledger fetches.
///
/// ```text
/// CLOSED --threshold failures--> OPEN --cool-down--> HALF_OPEN
/// HALF_OPEN --success--> CLOSED
/// HALF_OPEN --failure--> OPEN (cool-down restarts)
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            config,
        }
    }

    /// Whether a fetch may be attempted now. Moves OPEN to HALF_OPEN once
    /// the cool-down has elapsed.
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.opened_at {
                Some(opened) if opened.elapsed() < self.config.cool_down => false,
                _ => {
                    debug!("circuit breaker half-open");
                    self.state = CircuitState::HalfOpen;
                    true
                }
            },
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("circuit breaker closed (recovered)");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        "circuit breaker opening"
                    );
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit breaker reopening after half-open failure");
                self.open();
            }
            CircuitState::Open => {}
        }
    }

    /// Force CLOSED and forget all failures.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When an OPEN breaker will next allow a probe.
    pub fn retry_at(&self) -> Option<Instant> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) => Some(opened + self.config.cool_down),
            _ => None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
    }
}

/// Exponential backoff: failure `n` waits `min(base * 2^(n-1), cap)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            failures: 0,
            config,
        }
    }

    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.config.base;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.config
            .base
            .checked_mul(factor)
            .map_or(self.config.cap, |d| d.min(self.config.cap))
    }

    /// Count a failure and return the delay before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay_for(self.failures);
        debug!(failures = self.failures, ?delay, "backing off");
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay that applies right now; `base` when healthy.
    pub fn current_delay(&self) -> Duration {
        self.delay_for(self.failures)
    }
}

/// Health snapshot of one transport. Process-local, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelHealth {
    pub connected: bool,
    /// Last successful activity (Unix ms).
    pub last_activity: Option<i64>,
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
    pub current_delay: Duration,
}

impl ChannelHealth {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            connected: false,
            last_activity: None,
            consecutive_failures: 0,
            circuit: CircuitState::Closed,
            current_delay: base_delay,
        }
    }
}
