//! Cancellation context for child processes

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cancellation signal and optional deadline for a command
///
/// Clones share the cancellation flag, so a clone handed to another thread
/// can cancel the command being run.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done unless cancelled
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_done(&self) -> bool {
        self.done_reason().is_some()
    }

    /// Why the context ended, if it has
    pub fn done_reason(&self) -> Option<&'static str> {
        if self.cancelled.load(Ordering::SeqCst) {
            Some("context cancelled")
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some("deadline exceeded")
        } else {
            None
        }
    }
}
