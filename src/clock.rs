//! Monotonic time source for span timing
//!
//! Span offsets and durations are measured against a `Clock` rather than
//! `Instant::now()` directly so tests can drive time by hand and assert
//! exact offsets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic time source. `now()` is the elapsed time since the clock's
/// own epoch; only differences between two readings are meaningful.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Production clock backed by `Instant`.
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Hand-driven clock for tests. Shared via `Arc` so the test and the
/// engine observe the same timeline.
#[derive(Clone)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advance the clock by `d`.
    pub fn advance(&self, d: Duration) {
        self.micros
            .fetch_add(d.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_millis(40));
        assert_eq!(clock.now(), Duration::from_millis(40));

        let shared = clock.clone();
        shared.advance(Duration::from_millis(60));
        assert_eq!(clock.now(), Duration::from_millis(100));
    }
}
