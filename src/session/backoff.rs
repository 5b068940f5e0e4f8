//! # Reconnect Backoff
//!
//! Exponential backoff for unexpected closes: attempt `n` (1-based) waits
//! `base * 2^(n-1)`, capped at `max`. Once `max_attempts` have been used the
//! next request is refused and the session gives up.

use std::time::Duration;

use crate::config::ConnectionConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    ///
    /// Returns the attempt number alongside the delay.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let factor = 1u32.checked_shl(self.attempts - 1).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        Some((self.attempts, delay))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Call once a session is ready again.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_then_exhausted() {
        let mut backoff = Backoff::from_config(&ConnectionConfig::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|(_, d)| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![300, 600, 1200, 2400, 4800]);
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(30), 40);
        let delays: Vec<Duration> = (0..40).filter_map(|_| backoff.next_delay()).map(|(_, d)| d).collect();
        assert_eq!(delays[1], Duration::from_secs(20));
        assert!(delays.iter().skip(2).all(|d| *d == Duration::from_secs(30)));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(300), Duration::from_secs(30), 5);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some((1, Duration::from_millis(300))));
    }
}
