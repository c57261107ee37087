//! Consecutive-failure tracking with exponential backoff.

use std::time::Duration;

use tracing::debug;

/// Doubles the delay on every recorded failure, up to `max`.
/// A single success resets it to `base`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
            consecutive_failures: 0,
        }
    }

    /// Record a failure and return the delay to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.current;
        self.consecutive_failures += 1;
        self.current = (self.current * 2).min(self.max);
        debug!(
            failures = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "backing off"
        );
        delay
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current = self.base;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay the next failure would return.
    pub fn next_delay(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_failure() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(b.record_failure(), Duration::from_secs(1));
        assert_eq!(b.record_failure(), Duration::from_secs(2));
        assert_eq!(b.record_failure(), Duration::from_secs(4));
        assert_eq!(b.consecutive_failures(), 3);
    }

    #[test]
    fn caps_at_max() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..10 {
            b.record_failure();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn resets_on_success() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }
}
