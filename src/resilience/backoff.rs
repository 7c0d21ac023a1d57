//! Delay between origin connect attempts: exponential, capped, jittered.

use std::time::Duration;

use rand::Rng;

use crate::config::OriginConfig;

/// Connect retry schedule for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    attempts: u32,
    base_ms: u64,
    max_ms: u64,
}

impl RetrySchedule {
    pub fn new(attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            base_ms,
            max_ms: max_ms.max(base_ms),
        }
    }

    pub fn from_config(config: &OriginConfig) -> Self {
        Self::new(
            config.connect_attempts,
            config.retry_base_delay_ms,
            config.retry_max_delay_ms,
        )
    }

    /// Total attempts, the first one included. Never zero.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Sleep before attempt number `attempt` (0-based). The first attempt
    /// never waits.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || attempt >= self.attempts {
            return Duration::ZERO;
        }
        calculate_backoff(attempt, self.base_ms, self.max_ms)
    }
}

/// `base_ms * 2^(attempt-1)` capped at `max_ms`, minus up to 10% jitter so
/// concurrent retries toward one origin spread out without exceeding the cap.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(factor).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped - jitter)
}
