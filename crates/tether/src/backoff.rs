//! Reconnect delay calculation

use crate::config::ReconnectPolicy;
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay, bounded by the policy's maximum
///
/// Delays grow by `factor` after every failure and return to
/// `initial_delay` after [`Backoff::reset`], which the lifecycle manager
/// calls whenever a connection becomes ready.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    next: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a backoff at its initial delay
    pub fn new(policy: ReconnectPolicy) -> Self {
        let next = policy.initial_delay.min(policy.max_delay);
        Self {
            policy,
            next,
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.failures = self.failures.saturating_add(1);

        let grown = Duration::try_from_secs_f64(delay.as_secs_f64() * self.policy.factor)
            .unwrap_or(self.policy.max_delay);
        self.next = grown.max(delay).min(self.policy.max_delay);

        self.jittered(delay)
    }

    /// Return to the initial delay
    pub fn reset(&mut self) {
        self.next = self.policy.initial_delay.min(self.policy.max_delay);
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.policy.jitter <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.policy.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::try_from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
            .unwrap_or(delay)
            .min(self.policy.max_delay)
    }
}
