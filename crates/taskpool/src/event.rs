use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{PoolError, INFINITE_TIMEOUT};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Signal {
    Clear,
    /// Wake at most one waiter; consumed by the waiter that observes it.
    One,
    /// Latched: every current and future waiter observes `Ok` until `reset`.
    All,
}

/// A one-shot, resettable signal with timed wait.
///
/// `set` followed by `wait` yields `Ok` exactly once; multiple `set`s before
/// a `wait` collapse into a single `Ok`. The signal is consumed when `wait`
/// returns, so the event is reusable. `set_all` latches the signal instead,
/// which is what group completion needs: every waiter wakes.
pub struct Event {
    signal: Mutex<Signal>,
    notification: Condvar,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: Mutex::new(Signal::Clear),
            notification: Condvar::new(),
        }
    }

    /// Marks the event signalled and wakes at most one waiter.
    pub fn set(&self) {
        let mut signal = self.signal.lock();
        if *signal != Signal::All {
            *signal = Signal::One;
        }
        self.notification.notify_one();
    }

    /// Latches the event signalled and wakes every waiter.
    pub fn set_all(&self) {
        let mut signal = self.signal.lock();
        *signal = Signal::All;
        self.notification.notify_all();
    }

    /// Blocks until the event is signalled or `timeout_ms` elapses.
    ///
    /// The signal is consumed on return, including on timeout.
    pub fn wait(&self, timeout_ms: u32) -> Result<(), PoolError> {
        let mut signal = self.signal.lock();

        if timeout_ms == INFINITE_TIMEOUT {
            while *signal == Signal::Clear {
                self.notification.wait(&mut signal);
            }
        } else {
            let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
            while *signal == Signal::Clear {
                if self
                    .notification
                    .wait_until(&mut signal, deadline)
                    .timed_out()
                {
                    *signal = Signal::Clear;
                    return Err(PoolError::Timeout);
                }
            }
        }

        if *signal == Signal::One {
            *signal = Signal::Clear;
        }

        Ok(())
    }

    /// Clears the signal without waking anyone.
    pub fn reset(&self) {
        *self.signal.lock() = Signal::Clear;
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
