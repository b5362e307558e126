//! Worker status monitor and thread handle.
//!
//! Each pipeline thread parks on its [`WorkerControl`] while `Idle` and wakes
//! on any status change. `Exiting` is terminal: once set, no other status can
//! replace it.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::state::WorkerStatus;

#[derive(Debug)]
pub struct WorkerControl {
    name: &'static str,
    status: Mutex<WorkerStatus>,
    changed: Condvar,
}

impl WorkerControl {
    pub fn new(name: &'static str, status: WorkerStatus) -> Self {
        Self {
            name,
            status: Mutex::new(status),
            changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    pub fn is_exiting(&self) -> bool {
        self.status() == WorkerStatus::Exiting
    }

    /// Set the status and wake the worker. Returns `false` if the worker was
    /// already exiting.
    pub fn set(&self, status: WorkerStatus) -> bool {
        let mut current = self.status.lock();
        if *current == WorkerStatus::Exiting {
            return false;
        }
        *current = status;
        drop(current);
        self.changed.notify_all();
        true
    }

    /// Set `to` only if the status is currently `from`.
    pub fn compare_and_set(&self, from: WorkerStatus, to: WorkerStatus) -> bool {
        let mut current = self.status.lock();
        if *current != from {
            return false;
        }
        *current = to;
        drop(current);
        self.changed.notify_all();
        true
    }

    /// Block while `Idle`. Returns the status that ended the wait.
    pub fn wait_until_active(&self) -> WorkerStatus {
        let mut current = self.status.lock();
        while *current == WorkerStatus::Idle {
            self.changed.wait(&mut current);
        }
        *current
    }

    /// Like [`wait_until_active`](Self::wait_until_active), giving up after
    /// `timeout` with whatever the status is then.
    pub fn wait_until_active_timeout(&self, timeout: Duration) -> WorkerStatus {
        let mut current = self.status.lock();
        if *current == WorkerStatus::Idle {
            self.changed
                .wait_while_for(&mut current, |s| *s == WorkerStatus::Idle, timeout);
        }
        *current
    }
}

/// A named pipeline thread.
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new().name(name.clone()).spawn(body)?;
        Ok(Self {
            name,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish. Its control must already be `Exiting`
    /// and its queues closed, or this blocks.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}
