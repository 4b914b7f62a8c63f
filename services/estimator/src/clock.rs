//! Time sources used to stamp observations.

use chrono::{DateTime, Duration, FixedOffset, Local};
use parking_lot::Mutex;

/// Source of the current time for the store
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Current time, carrying the offset it should be reported in
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock in the host's local offset
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Clock that only moves when told to
///
/// Used for tests and for replaying recorded traffic at known times.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    /// Jump to an absolute time (may move backwards)
    pub fn set(&self, to: DateTime<FixedOffset>) {
        *self.current.lock() = to;
    }

    /// Move the clock by `by` (negative durations move it backwards)
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.current.lock()
    }
}
