//! Fatal error capture for the parallel phase
//!
//! The first fatal error raised by any task wins; later ones are logged and
//! dropped. Raising sets a cancel flag that tasks poll before starting, so
//! the remaining queue drains quickly. The caller re-raises the captured
//! error once every started task has finished.

use crate::error::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
pub struct ExceptionHandler {
    first: Mutex<Option<Error>>,
    failed: AtomicBool,
    job_failures: AtomicUsize,
}

impl ExceptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fatal error and cancel outstanding tasks
    pub fn handle(&self, error: Error) {
        let mut first = self.first.lock();
        if first.is_none() {
            tracing::error!(error = %error, "fatal error in parallel task, cancelling");
            *first = Some(error);
        } else {
            tracing::debug!(error = %error, "additional fatal error suppressed");
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Record a non-fatal per-job failure
    pub fn record_job_failure(&self, description: &str) {
        self.job_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(failure = description, "constraint evaluation failed");
    }

    /// Whether tasks should stop picking up work
    pub fn is_cancelled(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Take the captured error, if any
    ///
    /// The cancel flag stays set until [`reset`](Self::reset).
    pub fn take(&self) -> Option<Error> {
        self.first.lock().take()
    }

    /// Number of non-fatal job failures recorded
    pub fn job_failures(&self) -> usize {
        self.job_failures.load(Ordering::Relaxed)
    }

    /// Clear the captured error and the cancel flag
    pub fn reset(&self) {
        *self.first.lock() = None;
        self.failed.store(false, Ordering::SeqCst);
    }
}
