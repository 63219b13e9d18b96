//! Reconnect delay policy: capped exponential backoff plus random jitter.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff settings for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Reconnect attempts allowed after an unexpected close before giving up.
    pub max_retries: u32,
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
    /// Exclusive upper bound of the uniform jitter added on top.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(30_000),
            jitter: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`, without jitter.
    ///
    /// `attempt` is the retry count *before* this attempt (0 for the first
    /// reconnect). Saturates instead of overflowing for large attempts.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Full delay for `attempt`: the capped exponential part plus jitter drawn
    /// from `rng`.
    pub fn delay_for<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rng.gen_range(0..jitter_ms))
    }

    /// True once `retry_count` has used up every allowed attempt.
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
