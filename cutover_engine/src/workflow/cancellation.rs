//! Cooperative cancellation for workflow runs.
//!
//! A [`CancellationTokenSource`] owns the cancellation state and hands out
//! [`CancellationToken`]s. The executor checks its token only at task
//! boundaries: a task already executing is never interrupted, the next one
//! simply does not start.
//!
//! # Example
//!
//! ```ignore
//! let source = CancellationTokenSource::new();
//! let options = RunOptions::default().with_cancellation(source.token());
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     source.cancel();
//! });
//!
//! let result = orchestrator.run_with(context, options).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared cancelled flag plus the notifier waking its waiters.
#[derive(Debug, Default)]
struct Flag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Flag {
    fn is_set(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            // Register interest before checking, so a cancel in between is not lost
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Thread-safe cancellation token.
///
/// Clones share the same state; when the owning source cancels, every clone
/// reports cancelled. A token obtained from a [`ChildToken`] also reports
/// cancelled once the parent source cancels.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    local: Arc<Flag>,
    parent: Option<Arc<Flag>>,
}

impl CancellationToken {
    pub(crate) fn new() -> Self {
        Self {
            local: Arc::new(Flag::default()),
            parent: None,
        }
    }

    fn child_of(parent: &CancellationToken) -> Self {
        Self {
            local: Arc::new(Flag::default()),
            parent: Some(parent.local.clone()),
        }
    }

    /// Returns true if the token (or its parent) has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.local.is_set() || self.parent.as_ref().is_some_and(|p| p.is_set())
    }

    /// Waits until the token (or its parent) is cancelled.
    pub async fn cancelled(&self) {
        match &self.parent {
            None => self.local.wait().await,
            Some(parent) => {
                tokio::select! {
                    _ = parent.wait() => {}
                    _ = self.local.wait() => {}
                }
            }
        }
    }

    fn cancel(&self) {
        self.local.set();
    }
}

/// Owner of a cancellation token.
#[derive(Clone, Debug)]
pub struct CancellationTokenSource {
    token: CancellationToken,
}

impl CancellationTokenSource {
    /// Creates a source with a fresh, non-cancelled token.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Returns a token sharing this source's state.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the token. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true if [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Creates a token that is cancelled by this source or by itself.
    pub fn child_token(&self) -> ChildToken {
        ChildToken {
            token: CancellationToken::child_of(&self.token),
        }
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Token cancelled when either its parent or itself is cancelled.
///
/// Hand [`token`](Self::token) to a run to let both the parent source and
/// this child stop it; cancelling the child never touches the parent.
#[derive(Clone, Debug)]
pub struct ChildToken {
    token: CancellationToken,
}

impl ChildToken {
    /// Returns a run token observing both the parent and this child.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns true if the parent or this child was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels this child only.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits until the parent or this child is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_initially_not_cancelled() {
        let source = CancellationTokenSource::new();
        assert!(!source.token().is_cancelled());
        assert!(!source.is_cancelled());
    }

    #[test]
    fn test_cancel_is_shared_and_idempotent() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let clone = token.clone();

        source.cancel();
        source.cancel();

        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_child_token_hierarchy() {
        let source = CancellationTokenSource::new();
        let child = source.child_token();
        let sibling = source.child_token();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert!(!source.is_cancelled());

        source.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_child_run_token_observes_parent_and_child() {
        let source = CancellationTokenSource::new();
        let first = source.child_token();
        let second = source.child_token();
        let first_run = first.token();
        let second_run = second.token();

        first.cancel();
        assert!(first_run.is_cancelled());
        assert!(!second_run.is_cancelled());
        assert!(!source.token().is_cancelled());

        source.cancel();
        assert!(second_run.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let source = CancellationTokenSource::new();
        let token = source.token();

        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let source = CancellationTokenSource::new();
        source.cancel();

        tokio::time::timeout(Duration::from_millis(100), source.token().cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_waits_for_parent() {
        let source = CancellationTokenSource::new();
        let child = source.child_token();

        let waiter = tokio::spawn(async move { child.cancelled().await });
        source.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_run_token_wakes_on_parent_cancel() {
        let source = CancellationTokenSource::new();
        let token = source.child_token().token();

        let waiter = tokio::spawn(async move { token.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
