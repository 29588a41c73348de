//! The send latch that blocks double submission.
//!
//! Acquired synchronously before any send goes out and released when the
//! server confirms the send, when the send fails, or when the timeout
//! fires, whichever comes first. A lost confirmation therefore never
//! blocks sending for longer than the timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

struct LatchState {
    held: AtomicBool,
    /// Bumped on every acquisition so a stale timeout cannot release a
    /// later hold.
    epoch: AtomicU64,
    timeout: Duration,
}

/// Re-entrancy guard shared by every send path.
#[derive(Clone)]
pub struct SendLatch {
    state: Arc<LatchState>,
}

impl SendLatch {
    /// A released latch that auto-releases `timeout` after each acquisition.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(LatchState {
                held: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    /// Take the latch. Returns `false` if a send is already in flight.
    ///
    /// Must be called inside a tokio runtime; the timeout fallback runs as
    /// a spawned task.
    pub fn try_acquire(&self) -> bool {
        if self
            .state
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let epoch = self.state.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(state.timeout).await;
            if state.epoch.load(Ordering::Acquire) == epoch
                && state.held.swap(false, Ordering::AcqRel)
            {
                tracing::debug!("send latch released by timeout");
            }
        });
        true
    }

    /// Release the latch.
    pub fn release(&self) {
        self.state.held.store(false, Ordering::Release);
    }

    /// Whether a send is in flight.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.state.held.load(Ordering::Acquire)
    }
}
