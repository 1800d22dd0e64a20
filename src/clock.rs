//! Monotonic time source shared by every scheduler component.
//!
//! All timestamps and durations in this crate are signed 64-bit nanoseconds
//! on a single monotonic timeline. The clock is injected so tests can drive
//! deterministic time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Nanoseconds on the scheduler's monotonic timeline.
pub type Nanos = i64;

/// Nanoseconds per millisecond.
pub const NANOS_PER_MS: Nanos = 1_000_000;

/// Nanoseconds per second.
pub const NANOS_PER_SEC: Nanos = 1_000_000_000;

/// Monotonic time source.
///
/// Single source of truth for "now"; every component reads time through the
/// same injected instance.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds.
    fn now(&self) -> Nanos;
}

/// Production clock backed by [`Instant`].
///
/// Time zero is the moment of construction, which keeps values small and
/// comfortably inside `i64`.
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
    fn now(&self) -> Nanos {
        self.epoch.elapsed().as_nanos() as Nanos
    }
}

/// Manually driven clock for deterministic tests.
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a manual clock starting at `start` nanoseconds.
    pub fn new(start: Nanos) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Advance the clock by `delta` nanoseconds.
    pub fn advance(&self, delta: Nanos) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, now: Nanos) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nanos {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn test_manual_clock_is_explicit() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);

        clock.advance(500);
        assert_eq!(clock.now(), 1_500);

        clock.set(10 * NANOS_PER_MS);
        assert_eq!(clock.now(), 10_000_000);
    }
}
