//! Fixed-capacity, closable FIFO shared between threads.
//!
//! Admission uses two closable semaphores: `slots` counts free capacity and
//! `ready` counts queued items. A sender takes a slot before pushing and
//! releases a ready permit while still holding the queue lock; a receiver does
//! the mirror image. `close()` closes both semaphores, so every blocked party
//! wakes and no call can block on the channel afterwards.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::semaphore::{Permit, Semaphore};

type Disposer<T> = Box<dyn Fn(T) + Send + Sync>;

/// Error returned by [`BoundedChannel::try_send`]. The item is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(item) | TrySendError::Closed(item) => item,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    #[error("channel is empty")]
    Empty,
    #[error("channel is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvTimeoutError {
    #[error("timed out waiting on channel")]
    Timeout,
    #[error("channel is closed")]
    Closed,
}

/// Bounded multi-producer multi-consumer channel.
///
/// Items still queued when the channel is closed, cleared or dropped are
/// passed to the disposer exactly once.
pub struct BoundedChannel<T> {
    name: String,
    items: Mutex<VecDeque<T>>,
    slots: Semaphore,
    ready: Semaphore,
    closed: AtomicBool,
    capacity: usize,
    disposer: Disposer<T>,
}

impl<T: 'static> BoundedChannel<T> {
    /// Create a channel whose leftover items are simply dropped.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_disposer(name, capacity, drop)
    }

    /// Create a channel with a custom disposer for leftover items.
    pub fn with_disposer<D>(name: impl Into<String>, capacity: usize, disposer: D) -> Self
    where
        D: Fn(T) + Send + Sync + 'static,
    {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            closed: AtomicBool::new(false),
            capacity,
            disposer: Box::new(disposer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until there is room, then enqueue `item`.
    ///
    /// Returns `false` if the channel is (or becomes) closed; the item has
    /// then been disposed.
    pub fn send(&self, item: T) -> bool {
        if self.is_closed() {
            tracing::warn!(channel = %self.name, "send on closed channel");
            (self.disposer)(item);
            return false;
        }
        match self.slots.acquire() {
            Permit::Granted => self.push_admitted(item),
            _ => {
                (self.disposer)(item);
                false
            }
        }
    }

    /// Enqueue `item` only if a slot is free right now.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        match self.slots.try_acquire() {
            Permit::Granted => {
                let mut items = self.items.lock();
                if self.closed.load(Ordering::Acquire) {
                    return Err(TrySendError::Closed(item));
                }
                items.push_back(item);
                self.ready.release();
                Ok(())
            }
            Permit::Unavailable => Err(TrySendError::Full(item)),
            Permit::Closed => Err(TrySendError::Closed(item)),
        }
    }

    fn push_admitted(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(items);
            (self.disposer)(item);
            return false;
        }
        items.push_back(item);
        self.ready.release();
        true
    }

    /// Block until an item is available. `None` once the channel is closed.
    pub fn receive(&self) -> Option<T> {
        loop {
            match self.ready.acquire() {
                Permit::Granted => {
                    if let Some(item) = self.pop_admitted() {
                        return Some(item);
                    }
                    // cleared between admission and pop
                }
                _ => return None,
            }
        }
    }

    pub fn try_receive(&self) -> Result<T, TryRecvError> {
        match self.ready.try_acquire() {
            Permit::Granted => self.pop_admitted().ok_or(TryRecvError::Empty),
            Permit::Unavailable => Err(TryRecvError::Empty),
            Permit::Closed => Err(TryRecvError::Closed),
        }
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.ready.acquire_timeout(remaining) {
                Permit::Granted => {
                    if let Some(item) = self.pop_admitted() {
                        return Ok(item);
                    }
                    if remaining.is_zero() {
                        return Err(RecvTimeoutError::Timeout);
                    }
                }
                Permit::Unavailable => return Err(RecvTimeoutError::Timeout),
                Permit::Closed => return Err(RecvTimeoutError::Closed),
            }
        }
    }

    fn pop_admitted(&self) -> Option<T> {
        let mut items = self.items.lock();
        let item = items.pop_front()?;
        self.slots.release();
        Some(item)
    }

    /// Inspect the oldest item without removing it.
    pub fn front_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let items = self.items.lock();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        items.front().map(f)
    }

    /// Inspect the newest item without removing it.
    pub fn back_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let items = self.items.lock();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        items.back().map(f)
    }

    /// Dispose of every queued item without closing. Returns how many.
    pub fn clear(&self) -> usize {
        let drained: Vec<T> = {
            let mut items = self.items.lock();
            let drained: Vec<T> = items.drain(..).collect();
            // Receivers that were admitted but have not popped yet keep their
            // permit and will find the queue empty.
            for _ in 0..drained.len() {
                if self.ready.try_acquire() != Permit::Granted {
                    break;
                }
            }
            self.slots.release_many(drained.len());
            drained
        };
        let count = drained.len();
        for item in drained {
            (self.disposer)(item);
        }
        count
    }

    /// Close the channel, wake every blocked sender and receiver, and
    /// dispose of the remaining items.
    pub fn close(&self) {
        let drained: Vec<T> = {
            let mut items = self.items.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                tracing::warn!(channel = %self.name, "channel closed twice");
                return;
            }
            self.slots.close();
            self.ready.close();
            items.drain(..).collect()
        };
        tracing::debug!(channel = %self.name, disposed = drained.len(), "channel closed");
        for item in drained {
            (self.disposer)(item);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone + 'static> BoundedChannel<T> {
    pub fn front(&self) -> Option<T> {
        self.front_with(T::clone)
    }

    pub fn back(&self) -> Option<T> {
        self.back_with(T::clone)
    }
}

impl<T> Drop for BoundedChannel<T> {
    fn drop(&mut self) {
        let items = std::mem::take(self.items.get_mut());
        for item in items {
            (self.disposer)(item);
        }
    }
}

impl<T: 'static> fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
