//! Exponential backoff shared by the posting engine and the outbox
//! dispatcher.

use std::time::Duration;

/// Backoff curve: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before re-running `attempt` (1-based). Attempt 1 ran with no
    /// delay, so this is the wait after the first failure onward.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = 1u64 << exponent;
        let delay = self.base.saturating_mul(factor as u32);
        delay.min(self.max)
    }
}
