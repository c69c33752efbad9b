use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{PoolError, INFINITE_TIMEOUT};

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    // Bumped by notify_all; blocked senders and receivers that observe a new
    // generation return Interrupted so their caller can re-check exit state.
    interrupt_generation: u64,
}

/// A fixed-capacity MPMC queue with blocking send/receive.
///
/// Each successfully sent item is observed by exactly one receiver. FIFO
/// ordering holds per (sender, receiver) pair.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                interrupt_generation: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Non-blocking send. Returns the item back when the queue is full.
    pub fn send(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.items.len() == inner.capacity {
            return Err(item);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until there is space, then enqueues. Returns the item back if
    /// `notify_all` interrupts the wait.
    pub fn send_blocking(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        let generation = inner.interrupt_generation;
        while inner.items.len() == inner.capacity {
            self.not_full.wait(&mut inner);
            if inner.interrupt_generation != generation {
                return Err(item);
            }
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item arrives, `timeout_ms` elapses, or `notify_all`
    /// interrupts the wait.
    pub fn recv(&self, timeout_ms: u32) -> Result<T, PoolError> {
        let mut inner = self.inner.lock();
        let generation = inner.interrupt_generation;
        let deadline = (timeout_ms != INFINITE_TIMEOUT)
            .then(|| Instant::now() + Duration::from_millis(u64::from(timeout_ms)));

        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(item);
            }
            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                        return Err(PoolError::Timeout);
                    }
                }
                None => self.not_empty.wait(&mut inner),
            }
            if inner.interrupt_generation != generation {
                return Err(PoolError::Interrupted);
            }
        }
    }

    /// Wakes every blocked sender and receiver. Used for shutdown.
    pub fn notify_all(&self) {
        let mut inner = self.inner.lock();
        inner.interrupt_generation += 1;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}
