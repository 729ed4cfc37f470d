//! Per-key exponential back-off for transient reconcile failures

use std::time::Duration;

use dashmap::DashMap;

use super::engine::ObjectKey;

/// Exponential back-off: `base * 2^attempt`, capped at `max`
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

/// Tracks consecutive transient failures per resource
#[derive(Debug)]
pub struct RequeueTracker {
    attempts: DashMap<ObjectKey, u32>,
    base: Duration,
    max: Duration,
}

impl RequeueTracker {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            attempts: DashMap::new(),
            base,
            max,
        }
    }

    /// Delay before the next retry of `key`; each call counts one failure
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut attempt = self.attempts.entry(key.clone()).or_insert(0);
        let delay = calculate_backoff(*attempt, self.base, self.max);
        *attempt = attempt.saturating_add(1);
        delay
    }

    /// Forget the failure history of `key` after a clean reconcile
    pub fn reset(&self, key: &ObjectKey) {
        self.attempts.remove(key);
    }
}

impl Default for RequeueTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}
