//! Cooperative cancellation flag checked at suspension points.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use super::error::{EngineError, EngineResult};

/// Cheap cloneable cancellation handle. `cancel()` is sticky.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Error out if cancellation was requested. Call this at every
    /// suspension point.
    pub fn check(&self, what: &str) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::cancelled(format!("{} cancelled", what)))
        } else {
            Ok(())
        }
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Re-check after registering to avoid a lost wakeup.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_sticky_and_observable() {
        let flag = CancelFlag::new();
        assert!(flag.check("analyze").is_ok());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        flag.cancel();
        waiter.await.expect("waiter completes");

        assert!(flag.is_cancelled());
        let err = flag.check("analyze").unwrap_err();
        assert_eq!(err.kind(), "CANCELLED");
    }
}
