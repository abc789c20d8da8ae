//! Reconnection Policy
//!
//! Decides whether a dropped wire connection is retried, and how fast.
//! Retries back off exponentially up to a cap; the schedule resets on every
//! successful connection. `enabled` is cleared only when the user explicitly
//! goes offline or the server declares the client invalid.

use std::time::Duration;

/// Backoff multiplier applied between attempts.
const BACKOFF_MULTIPLIER: u32 = 2;

/// Reconnect decision state.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    enabled: bool,
    initial_delay: Duration,
    max_delay: Duration,
    next_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy with the given backoff bounds. Starts enabled.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            enabled: true,
            initial_delay,
            max_delay,
            next_delay: initial_delay,
            attempts: 0,
        }
    }

    /// Whether disconnects schedule a retry.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Enable or disable retries.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Number of attempts scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reset the backoff schedule (on a successful connection).
    pub fn reset(&mut self) {
        self.next_delay = self.initial_delay;
        self.attempts = 0;
    }

    /// Delay to wait before the next attempt, advancing the schedule.
    /// `None` when retries are disabled.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        let delay = self.next_delay;
        self.attempts += 1;
        self.next_delay = (self.next_delay * BACKOFF_MULTIPLIER).min(self.max_delay);
        Some(delay)
    }
}
