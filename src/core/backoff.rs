//! Reconnect Backoff
//!
//! Exponential delay between reconnection attempts:
//! `min(base * 2^attempt, max)`, bounded by a maximum attempt count.

use std::time::Duration;

/// Base delay before the first reconnect (ms).
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Upper bound for a single reconnect delay (ms).
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Reconnects scheduled before the connection is declared failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Reconnection delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay for attempt 0.
    pub base_delay: Duration,
    /// Cap applied to every delay.
    pub max_delay: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before reconnect number `attempt` (0-based).
    ///
    /// Saturates instead of overflowing for large attempt numbers.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = base.saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Whether another reconnect may be scheduled after `attempt` tries.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence_doubles_then_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..8)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]);
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(64), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_attempt_bound() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(9));
        assert!(!policy.allows(10));
    }
}
