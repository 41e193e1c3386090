//! A small hand-rolled cancellation token, in the spirit of the rest of
//! this crate's dependency policy: no extra crate is pulled in just to get
//! a cancellable tree of contexts. A token can be cancelled directly, or it
//! inherits cancellation from a parent it was derived from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellable context, analogous to a Go `context.Context` cancel
/// function. Cloning shares the same underlying flag; `child_token` derives
/// a new, independently-cancellable token that is also cancelled whenever
/// its ancestor is.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Derives a child token. Cancelling the parent cancels the child; the
    /// reverse is not true.
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let parent = self.clone();
        let child_for_task = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_for_task.cancel();
        });
        child
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once this token is cancelled. Safe to await repeatedly or
    /// after cancellation has already happened.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_observed() {
        let tok = CancellationToken::new();
        assert!(!tok.is_cancelled());
        tok.cancel();
        assert!(tok.is_cancelled());
        tok.cancelled().await;
    }

    #[tokio::test]
    async fn child_inherits_parent_cancellation() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        parent.cancel();
        child.cancelled().await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn child_cancel_does_not_affect_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
