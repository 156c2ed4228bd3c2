//! Exponential backoff with a derived attempt budget.
//!
//! The attempt budget is computed from the wall-clock retry budget via the
//! backoff curve itself, so the two cannot drift apart: a queue configured
//! with a 24h retry budget gets exactly the number of attempts whose
//! cumulative scheduled delay fits inside 24h.

use std::time::Duration;

/// Ceiling on the derived attempt budget. A budget beyond this is
/// indistinguishable from "retry forever", which no queue is allowed to be.
const ATTEMPT_CAP: u32 = 200;

/// Per-attempt delay policy. Pure and deterministic: no clock, no I/O.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay scheduled after the first failed attempt.
    pub first_delay: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy, clamping degenerate inputs: a sub-millisecond floor
    /// or a shrinking factor would make the attempt budget unbounded.
    pub fn new(first_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            first_delay: first_delay.max(Duration::from_millis(1)),
            factor: factor.max(1.0),
            max_delay: max_delay.max(first_delay),
        }
    }

    /// Delay scheduled after the given attempt (1-based) fails.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_ms = self.first_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.factor.powi(attempt as i32 - 1)).min(max_ms);
        Duration::from_millis(delay_ms.max(1.0) as u64)
    }

    /// The largest attempt count whose cumulative scheduled delay still fits
    /// inside `max_retry_time`. Always finite and at least 1.
    pub fn max_attempts(&self, max_retry_time: Duration) -> u32 {
        let mut attempts = 1u32;
        let mut total = Duration::ZERO;
        while attempts < ATTEMPT_CAP {
            let delay = self.delay_for_attempt(attempts);
            match total.checked_add(delay) {
                Some(next) if next <= max_retry_time => {
                    total = next;
                    attempts += 1;
                }
                _ => break,
            }
        }
        attempts
    }

    /// Sum of the delays scheduled by attempts `1..count` (the delay after
    /// the final attempt is never slept).
    pub fn cumulative_delay(&self, count: u32) -> Duration {
        (1..count).fold(Duration::ZERO, |acc, attempt| {
            acc.saturating_add(self.delay_for_attempt(attempt))
        })
    }
}
