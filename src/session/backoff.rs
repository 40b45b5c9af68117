use std::time::Duration;

use crate::config::SessionConfig;

/// Linear reconnect backoff: `attempt * base`, capped at `max`, giving up
/// after `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        ReconnectPolicy { base, max, max_attempts, attempts: 0 }
    }

    pub fn from_config(session: &SessionConfig) -> Self {
        Self::new(session.reconnect_base_delay(), session.reconnect_max_delay(), session.max_reconnect_attempts)
    }

    /// Count one more attempt and return its delay, `None` once the
    /// ceiling is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        return Some(std::cmp::min(self.base.saturating_mul(self.attempts), self.max));
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
