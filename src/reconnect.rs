use crate::config::ReconnectConfig;
use std::time::Duration;

/// Decides whether and when to retry a failed connection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    stopped: bool,
}

impl ReconnectPolicy {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            attempts: 0,
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            stopped: false,
        }
    }

    pub fn can_retry(&self) -> bool {
        !self.stopped && self.attempts < self.max_attempts
    }

    /// Count a failed attempt; the policy stops once the limit is reached
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.max_attempts {
            self.stopped = true;
        }
    }

    /// Backoff before the next attempt: `base * 2^attempts`, capped at `max_delay`
    pub fn next_delay(&self) -> Duration {
        let factor = 2u32.checked_pow(self.attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Block further automatic retries until `reset`
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.stopped = false;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
