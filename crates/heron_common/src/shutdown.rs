//! Stop signal shared between the engine and its background jobs.
//!
//! Jobs sleep between passes, and shutdown must cut that sleep short or
//! closing the engine stalls for up to a full interval. A bare flag
//! cannot wake a sleeper, so waiters park on a condvar tied to the flag
//! and `raise` notifies through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    raised: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal and wakes every parked waiter. The mutex is
    /// taken first so a waiter between its flag check and its park
    /// cannot miss the notification.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let _guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.condvar.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Parks for up to `duration`, waking early when the signal is
    /// raised. Returns whether it was. A spurious condvar wakeup goes
    /// back to sleep for the remainder of the deadline.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.mutex.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if self.is_raised() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _) = self
                .inner
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }
}
