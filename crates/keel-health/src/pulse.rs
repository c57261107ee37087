//! Keyed liveness timer.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::RwLock;

use keel_core::SharedClock;

/// Remembers when each key last pulsed.
///
/// A key is alive if it pulsed within the timeout. Keys that never pulsed
/// are not alive.
pub struct PulseMonitor<K> {
    clock: SharedClock,
    timeout: Duration,
    pulses: RwLock<HashMap<K, u64>>,
}

impl<K: Eq + Hash + Clone> PulseMonitor<K> {
    pub fn new(clock: SharedClock, timeout: Duration) -> Self {
        Self {
            clock,
            timeout,
            pulses: RwLock::new(HashMap::new()),
        }
    }

    /// Record a pulse for `key` at the current time.
    pub fn pulse(&self, key: K) {
        let now = self.clock.now_millis();
        self.pulses.write().insert(key, now);
    }

    pub fn is_alive(&self, key: &K) -> bool {
        self.is_alive_within(key, self.timeout)
    }

    pub fn is_alive_within(&self, key: &K, timeout: Duration) -> bool {
        let now = self.clock.now_millis();
        match self.pulses.read().get(key) {
            Some(&last) => now.saturating_sub(last) < timeout.as_millis() as u64,
            None => false,
        }
    }

    /// Epoch millis of the last pulse, if any.
    pub fn last_pulse(&self, key: &K) -> Option<u64> {
        self.pulses.read().get(key).copied()
    }

    pub fn forget(&self, key: &K) {
        self.pulses.write().remove(key);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::FakeClock;
    use std::sync::Arc;

    fn monitor(clock: Arc<FakeClock>) -> PulseMonitor<String> {
        PulseMonitor::new(clock, Duration::from_secs(60))
    }

    #[test]
    fn unknown_key_is_not_alive() {
        let m = monitor(FakeClock::new(0));
        assert!(!m.is_alive(&"host-a".to_string()));
    }

    #[test]
    fn pulse_expires_after_timeout() {
        let clock = FakeClock::new(1_000);
        let m = monitor(clock.clone());
        let key = "host-a".to_string();

        m.pulse(key.clone());
        assert!(m.is_alive(&key));

        clock.advance(Duration::from_secs(59));
        assert!(m.is_alive(&key));

        clock.advance(Duration::from_secs(1));
        assert!(!m.is_alive(&key));
    }

    #[test]
    fn custom_timeout_and_forget() {
        let clock = FakeClock::new(0);
        let m = monitor(clock.clone());
        let key = "host-b".to_string();

        m.pulse(key.clone());
        clock.advance(Duration::from_secs(5));
        assert!(!m.is_alive_within(&key, Duration::from_secs(5)));
        assert!(m.is_alive_within(&key, Duration::from_secs(6)));
        assert_eq!(m.last_pulse(&key), Some(0));

        m.forget(&key);
        assert!(!m.is_alive(&key));
    }

    #[test]
    fn concurrent_pulses() {
        let clock = FakeClock::new(0);
        let m = Arc::new(monitor(clock));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        m.pulse(format!("host-{}", (i * 100 + j) % 16));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for k in 0..16 {
            assert!(m.is_alive(&format!("host-{k}")));
        }
    }
}
