//! Run-wide cancellation token
//!
//! One token is shared by the dispatcher, every pipeline and the
//! aggregator. The first abort reason wins; later calls are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

use crate::error::AbortReason;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    reason: OnceLock<AbortReason>,
}

/// Cloneable cancellation signal carrying the reason for the abort
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// External cancellation
    pub fn cancel(&self) {
        self.cancel_with(AbortReason::Cancelled);
    }

    /// Cancel with a reason. Returns `true` if this call set the reason.
    pub fn cancel_with(&self, reason: AbortReason) -> bool {
        let first = self.inner.reason.set(reason).is_ok();
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<&AbortReason> {
        self.inner.reason.get()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before the flag check so a concurrent cancel is not missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());

        assert!(token.cancel_with(AbortReason::FailFast {
            pipeline: "slow".to_string()
        }));
        assert!(!token.cancel_with(AbortReason::Cancelled));

        assert!(token.is_cancelled());
        assert_eq!(
            token.reason(),
            Some(&AbortReason::FailFast {
                pipeline: "slow".to_string()
            })
        );
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert_eq!(token.reason(), Some(&AbortReason::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }
}
