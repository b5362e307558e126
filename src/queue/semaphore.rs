//! Closable counting semaphore.
//!
//! The admission primitive behind every bounded queue in the crate. Unlike a
//! plain counting semaphore it can be closed: closing wakes every waiter and
//! makes all further acquisitions fail, so nothing stays parked on a queue
//! that is being torn down.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// One permit was taken.
    Granted,
    /// No permit was free (non-blocking or timed attempt).
    Unavailable,
    /// The semaphore is closed.
    Closed,
}

#[derive(Debug)]
struct State {
    permits: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is free or the semaphore is closed.
    pub fn acquire(&self) -> Permit {
        let mut state = self.state.lock();
        while state.permits == 0 && !state.closed {
            self.available.wait(&mut state);
        }
        Self::take(&mut state)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Permit {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.permits == 0 && !state.closed {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        Self::take(&mut state)
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Permit {
        let mut state = self.state.lock();
        Self::take(&mut state)
    }

    fn take(state: &mut State) -> Permit {
        if state.closed {
            Permit::Closed
        } else if state.permits == 0 {
            Permit::Unavailable
        } else {
            state.permits -= 1;
            Permit::Granted
        }
    }

    pub fn release(&self) {
        self.release_many(1);
    }

    pub fn release_many(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.permits += n;
        drop(state);
        if n == 1 {
            self.available.notify_one();
        } else {
            self.available.notify_all();
        }
    }

    /// Close the semaphore and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }
}
