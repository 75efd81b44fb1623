//! Run cancellation token.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Invoked once with the cancellation reason.
pub type CancelCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Trips once per run; the first reason is the one reported.
///
/// The scheduler checks it before dispatching a stage and races every
/// dispatched stage against [`CancellationToken::cancelled`].
#[derive(Default)]
pub struct CancellationToken {
    reason: OnceLock<String>,
    notify: Notify,
    callbacks: Mutex<Vec<CancelCallback>>,
}

impl CancellationToken {
    /// Creates an untripped token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns false if the token had already tripped,
    /// in which case `reason` is discarded.
    ///
    /// Registered callbacks run on the calling thread before waiters wake.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.reason.set(reason).is_err() {
            return false;
        }
        let reason = self.reason().unwrap_or_default();
        info!(reason = reason, "Run cancellation requested");

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in &callbacks {
            invoke(callback, reason);
        }
        self.notify.notify_waiters();
        true
    }

    /// Registers `callback` to run once on cancellation.
    ///
    /// If the token has already tripped the callback runs immediately. A
    /// panicking callback is logged and does not stop the others.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let callback: CancelCallback = Box::new(callback);
        {
            let mut callbacks = self.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push(callback);
                return;
            }
        }
        invoke(&callback, self.reason().unwrap_or_default());
    }

    /// Number of callbacks waiting for cancellation.
    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Reason given by the first `cancel` call.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn invoke(callback: &CancelCallback, reason: &str) {
    if catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
        warn!("Cancellation callback panicked");
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .field("callbacks", &self.pending_callbacks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fresh_token_is_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.cancel("operator abort"));
        assert!(!token.cancel("interrupted"));

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("operator abort"));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_every_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[test]
    fn test_callbacks_run_once_with_first_reason() {
        let token = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        token.on_cancel(move |reason| sink.lock().push(reason.to_string()));
        assert_eq!(token.pending_callbacks(), 1);

        token.cancel("operator abort");
        token.cancel("interrupted");

        assert_eq!(*seen.lock(), vec!["operator abort".to_string()]);
        assert_eq!(token.pending_callbacks(), 0);
    }

    #[test]
    fn test_late_callback_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel("done");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        token.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_others() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        token.on_cancel(|_| panic!("callback failed"));
        let counter = calls.clone();
        token.on_cancel(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(token.cancel("stop"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_tripped() {
        let token = CancellationToken::new();
        token.cancel("done");
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }
}
