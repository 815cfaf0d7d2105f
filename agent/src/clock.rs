//! Time source capability.
//!
//! Trackers never read the wall clock directly; handlers ask a [`Clock`] for
//! "now" and pass it down, which keeps the trackers deterministic under test.

use std::cell::Cell;
use std::time::Duration;

use chrono::Utc;

use crate::types::Millis;

/// A source of millisecond timestamps.
pub trait Clock {
    /// Current time in milliseconds since the Unix epoch.
    fn now(&self) -> Millis;
}

/// Converts a [`Duration`] to whole milliseconds, saturating.
#[must_use]
pub fn to_millis(duration: Duration) -> Millis {
    u64::try_from(duration.as_millis()).unwrap_or(Millis::MAX)
}

/// Wall clock backed by [`chrono::Utc`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Millis {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// A clock that only moves when told to.
///
/// Used by tests and by the replay binary, which drives time from a script.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Millis>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Millis) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    /// Jumps to `at`. Time never moves backwards.
    pub fn set(&self, at: Millis) {
        self.now.set(self.now.get().max(at));
    }

    /// Moves forward by `delta` milliseconds.
    pub fn advance(&self, delta: Millis) {
        self.now.set(self.now.get().saturating_add(delta));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        self.now.get()
    }
}
