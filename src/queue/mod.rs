//! Bounded, closable queues shared between pipeline threads.

pub mod channel;
pub mod semaphore;
pub mod timeline;

pub use channel::{BoundedChannel, RecvTimeoutError, TryRecvError, TrySendError};
pub use semaphore::{Permit, Semaphore};
pub use timeline::{FrameTimeline, PushOutcome, TimelineEntry};
