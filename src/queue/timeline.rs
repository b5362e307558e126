//! Presentation-ordered queue of decoded frames.
//!
//! Same two-semaphore admission as [`BoundedChannel`](super::BoundedChannel),
//! specialised for `(frame, present_ms)` entries. Each timeline carries a
//! generation counter that [`FrameTimeline::clear`] bumps. A producer reads the
//! generation when it takes a frame out of its decoder and hands it back on
//! push, so a frame decoded before a seek can never land after it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;

use super::semaphore::{Permit, Semaphore};
use crate::time::{Millis, NOPTS};

/// One queued frame and the media time at which it should be presented.
///
/// An entry without a frame and with `present_ms == NOPTS` marks the end of
/// the stream.
#[derive(Debug)]
pub struct TimelineEntry<F> {
    pub frame: Option<F>,
    pub present_ms: Millis,
}

impl<F> TimelineEntry<F> {
    pub fn new(frame: F, present_ms: Millis) -> Self {
        Self {
            frame: Some(frame),
            present_ms,
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            frame: None,
            present_ms: NOPTS,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.frame.is_none() && self.present_ms == NOPTS
    }
}

/// What happened to a frame offered to [`FrameTimeline::push_fresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Presentation time already passed.
    Late,
    /// Not after the current back entry.
    OutOfOrder,
    /// Decoded before the last `clear()`.
    Stale,
    Closed,
}

impl PushOutcome {
    /// The frame was discarded but the timeline is still usable.
    pub fn is_dropped(self) -> bool {
        matches!(self, PushOutcome::Late | PushOutcome::OutOfOrder | PushOutcome::Stale)
    }
}

struct Inner<F> {
    entries: VecDeque<TimelineEntry<F>>,
    generation: u64,
    closed: bool,
}

pub struct FrameTimeline<F> {
    name: String,
    inner: Mutex<Inner<F>>,
    slots: Semaphore,
    ready: Semaphore,
    capacity: usize,
}

impl<F> FrameTimeline<F> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
                generation: 0,
                closed: false,
            }),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Append an entry unconditionally, blocking while the timeline is full.
    /// Returns `false` if the timeline was closed.
    pub fn push_back(&self, entry: TimelineEntry<F>) -> bool {
        if self.slots.acquire() != Permit::Granted {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        inner.entries.push_back(entry);
        self.ready.release();
        true
    }

    /// Enqueue a freshly decoded frame, applying the drop policy.
    ///
    /// The frame is dropped if it is already late (`present_ms < played_ms`),
    /// if the back entry is not strictly earlier, or if `generation` no longer
    /// matches. Blocks while the timeline is full.
    pub fn push_fresh(&self, frame: F, present_ms: Millis, played_ms: Millis, generation: u64) -> PushOutcome {
        {
            let inner = self.inner.lock();
            if let Some(outcome) = Self::reject(&inner, present_ms, played_ms, generation) {
                return outcome;
            }
        }
        if self.slots.acquire() != Permit::Granted {
            return PushOutcome::Closed;
        }
        let mut inner = self.inner.lock();
        // re-check: a clear() may have run while we waited for room
        if let Some(outcome) = Self::reject(&inner, present_ms, Millis::MIN, generation) {
            if outcome != PushOutcome::Closed {
                self.slots.release();
            }
            return outcome;
        }
        inner.entries.push_back(TimelineEntry::new(frame, present_ms));
        self.ready.release();
        PushOutcome::Queued
    }

    fn reject(inner: &Inner<F>, present_ms: Millis, played_ms: Millis, generation: u64) -> Option<PushOutcome> {
        if inner.closed {
            return Some(PushOutcome::Closed);
        }
        if inner.generation != generation {
            return Some(PushOutcome::Stale);
        }
        if present_ms < played_ms {
            return Some(PushOutcome::Late);
        }
        match inner.entries.back() {
            Some(back) if back.is_end_of_stream() || back.present_ms >= present_ms => {
                Some(PushOutcome::OutOfOrder)
            }
            _ => None,
        }
    }

    /// Append the end-of-stream sentinel if `generation` is still current.
    pub fn push_end_of_stream(&self, generation: u64) -> PushOutcome {
        if self.inner.lock().generation != generation {
            return PushOutcome::Stale;
        }
        if self.slots.acquire() != Permit::Granted {
            return PushOutcome::Closed;
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return PushOutcome::Closed;
        }
        if inner.generation != generation {
            self.slots.release();
            return PushOutcome::Stale;
        }
        inner.entries.push_back(TimelineEntry::end_of_stream());
        self.ready.release();
        PushOutcome::Queued
    }

    /// Block until an entry is available. `None` once closed.
    pub fn pop_front(&self) -> Option<TimelineEntry<F>> {
        loop {
            if self.ready.acquire() != Permit::Granted {
                return None;
            }
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.pop_front() {
                self.slots.release();
                return Some(entry);
            }
        }
    }

    pub fn try_pop_front(&self) -> Option<TimelineEntry<F>> {
        let mut inner = self.inner.lock();
        self.take_front(&mut inner)
    }

    // Caller holds the lock and has decided the front entry goes.
    fn take_front(&self, inner: &mut Inner<F>) -> Option<TimelineEntry<F>> {
        if inner.entries.is_empty() || self.ready.try_acquire() != Permit::Granted {
            return None;
        }
        let entry = inner.entries.pop_front()?;
        self.slots.release();
        Some(entry)
    }

    pub fn peek_front_ms(&self) -> Option<Millis> {
        self.inner.lock().entries.front().map(|e| e.present_ms)
    }

    pub fn peek_back_ms(&self) -> Option<Millis> {
        self.inner.lock().entries.back().map(|e| e.present_ms)
    }

    /// Pop the front entry if it is due at `now_ms`. The end-of-stream
    /// sentinel is always due. A not-yet-due frame stays queued.
    pub fn try_pop_if_due(&self, now_ms: Millis) -> Option<TimelineEntry<F>> {
        let mut inner = self.inner.lock();
        let due = match inner.entries.front() {
            Some(front) => front.is_end_of_stream() || front.present_ms <= now_ms,
            None => false,
        };
        if !due {
            return None;
        }
        self.take_front(&mut inner)
    }

    /// Pop the first entry that is not late at `now_ms`, discarding the late
    /// ones in front of it. Returns the entry (if any) and how many were
    /// discarded.
    pub fn pop_fresh(&self, now_ms: Millis) -> (Option<TimelineEntry<F>>, usize) {
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        loop {
            let late = match inner.entries.front() {
                Some(front) => !front.is_end_of_stream() && front.present_ms < now_ms,
                None => return (None, dropped),
            };
            let Some(entry) = self.take_front(&mut inner) else {
                return (None, dropped);
            };
            if !late {
                return (Some(entry), dropped);
            }
            dropped += 1;
        }
    }

    /// Remove leading entries matching `stale`. Returns how many were removed.
    pub fn drop_while(&self, mut stale: impl FnMut(&TimelineEntry<F>) -> bool) -> usize {
        let removed: Vec<TimelineEntry<F>> = {
            let mut inner = self.inner.lock();
            let mut removed = Vec::new();
            while inner.entries.front().is_some_and(&mut stale) {
                match self.take_front(&mut inner) {
                    Some(entry) => removed.push(entry),
                    None => break,
                }
            }
            removed
        };
        removed.len()
    }

    /// Drop every entry and start a new generation. Returns the new
    /// generation.
    pub fn clear(&self) -> u64 {
        let (generation, removed) = {
            let mut inner = self.inner.lock();
            let removed: Vec<TimelineEntry<F>> = inner.entries.drain(..).collect();
            for _ in 0..removed.len() {
                if self.ready.try_acquire() != Permit::Granted {
                    break;
                }
            }
            self.slots.release_many(removed.len());
            inner.generation = inner.generation.wrapping_add(1);
            (inner.generation, removed)
        };
        drop(removed);
        generation
    }

    /// Close the timeline, waking every blocked producer and consumer.
    pub fn close(&self) {
        let removed: Vec<TimelineEntry<F>> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                tracing::warn!(timeline = %self.name, "timeline closed twice");
                return;
            }
            inner.closed = true;
            inner.generation = inner.generation.wrapping_add(1);
            self.slots.close();
            self.ready.close();
            inner.entries.drain(..).collect()
        };
        tracing::debug!(timeline = %self.name, disposed = removed.len(), "timeline closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<F> fmt::Debug for FrameTimeline<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FrameTimeline")
            .field("name", &self.name)
            .field("len", &inner.entries.len())
            .field("capacity", &self.capacity)
            .field("generation", &inner.generation)
            .field("closed", &inner.closed)
            .finish()
    }
}
