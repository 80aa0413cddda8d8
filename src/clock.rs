//! Time sources for rate limiting algorithms.
//!
//! Algorithms read time as Unix seconds with a fractional part. The same
//! representation is passed to the shared store, so every worker computes
//! refill and drain with the same formula.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// A source of the current time in Unix seconds.
pub trait Clock: Send + Sync {
    /// Current time in seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Wall clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        let now = chrono::Utc::now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to a
/// backend and advance another.
#[derive(Clone)]
pub struct ManualClock {
    current: Arc<Mutex<f64>>,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward by `secs` seconds.
    pub fn advance(&self, secs: f64) {
        *self.current.lock() += secs;
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, secs: f64) {
        *self.current.lock() = secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.current.lock()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("now", &self.now()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        let clock = SystemClock::new();
        assert!(clock.now() > 1_577_836_800.0);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(100.0);
        let other = clock.clone();

        other.advance(2.5);
        assert_eq!(clock.now(), 102.5);

        clock.set(10.0);
        assert_eq!(other.now(), 10.0);
    }
}
