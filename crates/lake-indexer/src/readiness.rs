//! One-way readiness latch.
//!
//! A view starts not-ready and becomes ready after its first successful
//! refresh. The latch never resets: later failures are reported through
//! metrics and logs, not by flipping readiness back.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Latch flipped once by the first successful refresh.
#[derive(Debug, Default)]
pub struct ReadinessLatch {
    ready: AtomicBool,
    notify: Notify,
}

impl ReadinessLatch {
    /// Creates a latch in the not-ready state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the latch ready; returns true only for the call that flipped it.
    pub fn mark_ready(&self) -> bool {
        let flipped = !self.ready.swap(true, Ordering::AcqRel);
        if flipped {
            self.notify.notify_waiters();
        }
        flipped
    }

    /// Returns true once the latch has been marked.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Waits until the latch is marked ready.
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }
}
