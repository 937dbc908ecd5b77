//! Monotonic time sources
//!
//! All timestamps inside the engine are seconds relative to a clock anchor.
//! Anchoring on `Instant` keeps wait durations immune to NTP adjustments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic time in seconds
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds elapsed since the clock was created
    fn monotonic_time(&self) -> f64;
}

/// Wall-clock backed monotonic time
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start_time: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to
///
/// Useful for driving wait durations and slow-call classification in tests
/// without sleeping.
///
/// ```rust
/// use breaker_engine::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_millis(1500));
/// assert_eq!(clock.monotonic_time(), 1.5);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn monotonic_time(&self) -> f64 {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire)).as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();

        let time1 = clock.monotonic_time();
        std::thread::sleep(Duration::from_millis(10));
        let time2 = clock.monotonic_time();

        assert!(time2 > time1);
    }

    #[test]
    fn test_manual_clock_only_moves_on_advance() {
        let clock = ManualClock::new();
        assert_eq!(clock.monotonic_time(), 0.0);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.monotonic_time(), 0.0);

        clock.advance(Duration::from_secs(2));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.monotonic_time(), 2.25);
    }
}
