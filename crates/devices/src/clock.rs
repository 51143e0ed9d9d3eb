//! The machine timebase.
//!
//! A manually-advanced monotonic clock shared by every time-derived device
//! model. The host driver advances it (from wall time in the CLI, by fixed
//! steps in tests), which keeps device behaviour deterministic under test.

use std::cell::Cell;
use std::rc::Rc;

#[derive(Clone, Default)]
pub struct Clock {
    inner: Rc<ClockInner>,
}

#[derive(Default)]
struct ClockInner {
    now_ns: Cell<u64>,
    /// Wall-clock anchor for the RTC: Unix seconds at now_ns == 0.
    epoch_unix_secs: Cell<u64>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ns(&self) -> u64 {
        self.inner.now_ns.get()
    }

    pub fn advance_ns(&self, delta: u64) {
        let now = self.inner.now_ns.get();
        self.inner.now_ns.set(now.wrapping_add(delta));
    }

    pub fn set_epoch_unix_secs(&self, secs: u64) {
        self.inner.epoch_unix_secs.set(secs);
    }

    /// Current wall time in Unix seconds, as the RTC sees it.
    pub fn unix_secs(&self) -> u64 {
        self.inner.epoch_unix_secs.get() + self.inner.now_ns.get() / 1_000_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_handles_see_the_same_time() {
        let a = Clock::new();
        let b = a.clone();
        a.advance_ns(123);
        assert_eq!(b.now_ns(), 123);
    }

    #[test]
    fn unix_time_tracks_the_epoch() {
        let clock = Clock::new();
        clock.set_epoch_unix_secs(1_000_000);
        clock.advance_ns(2_500_000_000);
        assert_eq!(clock.unix_secs(), 1_000_002);
    }
}
