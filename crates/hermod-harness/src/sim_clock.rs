//! Virtual wall clock for deterministic runs.

use std::cell::Cell;

use hermod_core::{Clock, WallTime};

/// A settable clock. Sleeps advance virtual time instantly, and the
/// clock can be stepped backward to exercise rewind handling.
#[derive(Debug)]
pub struct SimClock {
    now: Cell<WallTime>,
    slept_ms: Cell<u64>,
}

impl SimClock {
    /// Clock starting at an arbitrary nonzero time.
    pub fn new() -> SimClock {
        SimClock { now: Cell::new(WallTime::from_millis(1_000_000)), slept_ms: Cell::new(0) }
    }

    /// Step time forward.
    pub fn advance_ms(&self, ms: u64) {
        let now = self.now.get().as_millis() as u64;
        self.now.set(WallTime::from_millis(now + ms));
    }

    /// Step time backward, as a stepped system clock would.
    pub fn rewind_ms(&self, ms: u64) {
        let now = self.now.get().as_millis() as u64;
        self.now.set(WallTime::from_millis(now.saturating_sub(ms)));
    }

    /// Total virtual milliseconds spent in [`Clock::sleep_ms`].
    pub fn slept_ms(&self) -> u64 {
        self.slept_ms.get()
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn wall_now(&self) -> WallTime {
        self.now.get()
    }

    fn sleep_ms(&self, ms: u64) {
        self.slept_ms.set(self.slept_ms.get() + ms);
        self.advance_ms(ms);
    }
}
