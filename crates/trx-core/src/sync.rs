//! Locking helpers shared by the clock and the burst queue.

use std::backtrace::Backtrace;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use tracing::warn;

/// How long a lock may stay contended before the watchdog fires.
const WATCHDOG_LIMIT: Duration = Duration::from_secs(1);

/// Poll interval while waiting on a contended lock.
const WATCHDOG_POLL: Duration = Duration::from_millis(10);

/// Mutex with a deadlock watchdog: if the lock stays held elsewhere for
/// more than a second, a backtrace is logged and the caller falls back to
/// a plain blocking acquire. Diagnostic only; lock semantics are
/// unchanged.
pub struct WatchdogMutex<T> {
    inner: Mutex<T>,
}

impl<T> WatchdogMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        let start = Instant::now();
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(p)) => return p.into_inner(),
                Err(TryLockError::WouldBlock) => {}
            }
            if start.elapsed() >= WATCHDOG_LIMIT {
                warn!(
                    "lock contended for over {:?}, possible deadlock\n{}",
                    WATCHDOG_LIMIT,
                    Backtrace::force_capture()
                );
                return self.inner.lock().unwrap_or_else(|p| p.into_inner());
            }
            std::thread::sleep(WATCHDOG_POLL);
        }
    }
}

impl<T: Default> Default for WatchdogMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
