//! Shared monotonic GSM clock with update notification.

use std::sync::Condvar;
use std::time::Duration;

use crate::gsm_time::GsmTime;
use crate::sync::WatchdogMutex;

/// Default ceiling for [`RadioClock::wait`].
const WAIT_CEILING: Duration = Duration::from_millis(1);

/// The basestation clock.
///
/// The RX pump advances it one timeslot per carved burst; TX consumers
/// snapshot it to schedule future writes. Every mutation wakes all
/// waiters.
#[derive(Default)]
pub struct RadioClock {
    time: WatchdogMutex<GsmTime>,
    update: Condvar,
}

impl RadioClock {
    pub fn new(start: GsmTime) -> Self {
        Self {
            time: WatchdogMutex::new(start),
            update: Condvar::new(),
        }
    }

    pub fn set(&self, time: GsmTime) {
        let mut clock = self.time.lock();
        *clock = time;
        self.update.notify_all();
    }

    /// Advance the clock by one timeslot.
    pub fn inc_tn(&self) {
        let mut clock = self.time.lock();
        // A single-slot step is always within bounds.
        let _ = clock.inc_tn(1);
        self.update.notify_all();
    }

    /// Snapshot the current time.
    pub fn get(&self) -> GsmTime {
        *self.time.lock()
    }

    /// Block until the next clock mutation, or for at most 1 ms.
    pub fn wait(&self) {
        self.wait_for(WAIT_CEILING);
    }

    /// Block until the next clock mutation, or for at most `timeout`.
    pub fn wait_for(&self, timeout: Duration) {
        let clock = self.time.lock();
        let _ = self.update.wait_timeout(clock, timeout);
    }
}
