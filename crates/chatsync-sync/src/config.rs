//! Engine configuration.

use std::time::Duration;

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive fetch failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing a probe.
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff tuning: `min(base * 2^(n-1), cap)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

/// Push channel tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    /// Upper bound on the availability probe.
    pub probe_timeout: Duration,
    /// Reconnect attempts after a drop before giving up for the session.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect attempt, doubled per attempt.
    pub reconnect_base_delay: Duration,
    /// Keep-alive period while connected.
    pub heartbeat_interval: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Regular poll period while healthy.
    pub poll_interval: Duration,
    /// Bound on each ledger query.
    pub fetch_timeout: Duration,
    /// Delay of the extra poll cycle scheduled after push traffic.
    pub push_follow_up: Duration,
    /// Capacity of the host event channel.
    pub event_capacity: usize,
    pub breaker: BreakerConfig,
    pub backoff: BackoffConfig,
    pub push: PushConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(10),
            push_follow_up: Duration::from_millis(250),
            event_capacity: 256,
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
            push: PushConfig::default(),
        }
    }
}
