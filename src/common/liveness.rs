//! Liveness - explicit cancellation for sessions and connectors
//!
//! Every task belonging to one proxied stream shares a `Liveness`. Loops check
//! it before issuing the next read or write and race `cancelled()` against their
//! pending I/O, so tearing a stream down does not depend on reference counts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct LivenessState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    state: Arc<LivenessState>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as cancelled and wake every waiter
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let liveness = Liveness::new();
        let waiter = liveness.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        liveness.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(liveness.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_after_cancel_returns_immediately() {
        let liveness = Liveness::new();
        liveness.cancel();
        liveness.cancelled().await;
    }
}
