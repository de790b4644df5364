/*!
    time source used by the cyclic scheduler and the mailbox polling.

    Every waiting in this crate goes through a [Clock], so the whole master can run against a [SimulatedClock] where time only advances when something sleeps or when the simulation advances it. Times are expressed as durations since the clock origin.
*/

use parking_lot::{Mutex, MutexGuard};
use std::time::Instant;
use core::time::Duration;


/// monotonic time source with absolute-deadline sleeping
pub trait Clock: Send + Sync {
    /// time elapsed since the clock origin
    fn now(&self) -> Duration;
    /// block until the given time since origin, return immediately if already passed
    fn sleep_until(&self, deadline: Duration);
    /// block for the given duration
    fn sleep(&self, duration: Duration) {
        self.sleep_until(self.now() + duration)
    }
}

/// wall clock, based on [std::time::Instant]
pub struct SystemClock {
    origin: Instant,
}
impl SystemClock {
    pub fn new() -> Self {
        Self {origin: Instant::now()}
    }
}
impl Default for SystemClock {
    fn default() -> Self {Self::new()}
}
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
    fn sleep_until(&self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/**
    simulated time, sleeping advances the time instead of blocking

    This is meant for tests: a whole run of cycles executes at full speed, while timings observed by the scheduler are exactly those it requested, plus any delay injected with [Self::advance].
*/
#[derive(Default)]
pub struct SimulatedClock {
    now: Mutex<Duration>,
}
impl SimulatedClock {
    pub fn new() -> Self  {Self::default()}
    /// move the time forward, simulating some work or transmission delay
    pub fn advance(&self, duration: Duration) {
        *self.lock() += duration;
    }
    fn lock(&self) -> MutexGuard<'_, Duration> {
        self.now.lock()
    }
}
impl Clock for SimulatedClock {
    fn now(&self) -> Duration {
        *self.lock()
    }
    fn sleep_until(&self, deadline: Duration) {
        let mut now = self.lock();
        if deadline > *now {
            *now = deadline;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_sleep() {
        let clock = SimulatedClock::new();
        clock.sleep(Duration::from_millis(3));
        clock.advance(Duration::from_millis(2));
        assert_eq!(clock.now(), Duration::from_millis(5));
        // deadlines in the past do not move time backward
        clock.sleep_until(Duration::from_millis(1));
        assert_eq!(clock.now(), Duration::from_millis(5));
    }

    #[test]
    fn system_monotonic() {
        let clock = SystemClock::new();
        let start = clock.now();
        clock.sleep_until(start + Duration::from_millis(2));
        assert!(clock.now() >= start + Duration::from_millis(2));
    }
}
