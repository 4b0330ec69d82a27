//! The interrupt flag shared by a batch and its runs.

use std::sync::OnceLock;
use tokio::sync::Notify;
use tracing::debug;

/// Records that the user asked the batch to stop.
///
/// The first reason wins; later calls to [`CancellationToken::cancel`] are
/// ignored. Stage attempts and backoff sleeps race
/// [`CancellationToken::cancelled`], and the scheduler polls
/// [`CancellationToken::is_cancelled`] between items.
#[derive(Debug, Default)]
pub struct CancellationToken {
    reason: OnceLock<String>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes every waiter.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.reason.set(reason.clone()).is_ok() {
            debug!(reason = %reason, "Cancellation requested");
            self.notify.notify_waiters();
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Returns the first cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
