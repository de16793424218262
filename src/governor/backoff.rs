//! Exponential backoff shared by the rate governor and stream supervisors.
//!
//! One combinator owns the retry arithmetic so the delay policy stays a
//! single composable unit instead of being recomputed at every call site.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff state: `base * 2^attempts`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay the next failure would wait, without consuming an attempt.
    pub fn peek(&self) -> Duration {
        // Saturate the shift well before Duration overflows.
        let factor = 1u64 << self.attempts.min(32);
        let delay = self.base.saturating_mul(factor.min(u32::MAX as u64) as u32);
        delay.min(self.cap)
    }

    /// Consume one attempt and return the delay to wait before retrying.
    pub fn advance(&mut self) -> Duration {
        let delay = self.peek();
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Reset after a success; the next failure starts from `base` again.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Add up to 25% of uniform jitter on top of a deterministic delay, to keep
/// a fleet of reconnecting clients from stampeding the exchange together.
pub fn jittered(delay: Duration) -> Duration {
    let span = delay.as_millis() as u64 / 4;
    if span == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
}
