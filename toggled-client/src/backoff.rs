//! Reconnect delay policies.

use std::fmt;
use std::time::Duration;

/// Default upper bound (exclusive) for the reconnect jitter window.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(5);

/// Chooses how long to wait before reconnect attempt `attempt` (0-based,
/// reset after every successful reconnect).
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Uniformly random delay in `[0, max)`, independent of the attempt count.
#[derive(Debug, Clone)]
pub struct UniformJitter {
    max: Duration,
}

impl UniformJitter {
    pub fn new(max: Duration) -> Self {
        Self { max }
    }
}

impl Default for UniformJitter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JITTER)
    }
}

impl BackoffPolicy for UniformJitter {
    fn next_delay(&self, _attempt: u32) -> Duration {
        jitter(self.max)
    }
}

/// `min(base * 2^attempt, max)` plus uniform jitter in `[0, jitter)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        // 1s, 2s, 4s, 8s, ... capped at `max`
        let exp = attempt.min(30);
        let backoff = self.base.saturating_mul(1u32 << exp).min(self.max);
        backoff + jitter(self.jitter)
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis().min(u128::from(u64::MAX)) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..max_ms))
}
