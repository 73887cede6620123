//! Cancellation scopes with cause propagation.
//!
//! Every worker, pipeline, job, and session owns a [`Scope`] derived from
//! its parent. Cancelling a scope carries a [`Cause`]; the first cause
//! installed wins and is the source of truth for the terminal status. A
//! scope cancelled by its parent reports the parent's cause.

use std::sync::{Arc, OnceLock};

use gosu_types::{Cause, TaskResult};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Scope {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    cause: OnceLock<Cause>,
    parent: Option<Scope>,
}

impl Scope {
    /// A fresh root scope.
    pub fn new() -> Scope {
        Scope {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child scope: cancelled when the parent cancels, but with its
    /// own cause slot so a child terminating does not disturb siblings.
    pub fn child(&self) -> Scope {
        Scope {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel with the given cause. Returns true if this call installed the
    /// cause (first caller wins).
    pub fn cancel(&self, cause: Cause) -> bool {
        let won = self.inner.cause.set(cause).is_ok();
        self.inner.token.cancel();
        won
    }

    /// Cancel signalling successful completion.
    pub fn cancel_ok(&self) -> bool {
        self.cancel(Cause::complete())
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once this scope (or any ancestor) is cancelled.
    pub async fn done(&self) {
        self.inner.token.cancelled().await;
    }

    /// The installed cause, walking up to ancestors when this scope was
    /// cancelled transitively. `Cancelled` when no cause was recorded.
    pub fn cause(&self) -> Cause {
        let mut here = Some(self);
        while let Some(scope) = here {
            if let Some(cause) = scope.inner.cause.get() {
                return cause.clone();
            }
            here = scope.inner.parent.as_ref();
        }
        Cause::of(gosu_types::Status::Cancelled)
    }

    /// The terminal result: `Ok` when the cause signals completion.
    pub fn result(&self) -> TaskResult {
        let cause = self.cause();
        if cause.is_ok() {
            Ok(())
        } else {
            Err(cause)
        }
    }

    /// Run `f` once the scope is done. The hook lives on its own task.
    pub fn on_done<F: FnOnce() + Send + 'static>(&self, f: F) {
        let scope = self.clone();
        tokio::spawn(async move {
            scope.done().await;
            f();
        });
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gosu_types::Status;

    #[tokio::test]
    async fn first_cause_wins() {
        let scope = Scope::new();
        assert!(scope.cancel(Cause::of(Status::TimeoutExec)));
        assert!(!scope.cancel(Cause::of(Status::Cancelled)));
        assert_eq!(scope.cause().status(), Status::TimeoutExec);
    }

    #[tokio::test]
    async fn ok_cause_is_success() {
        let scope = Scope::new();
        scope.cancel_ok();
        assert!(scope.result().is_ok());
    }

    #[tokio::test]
    async fn child_inherits_parent_cause() {
        let parent = Scope::new();
        let child = parent.child();
        parent.cancel(Cause::errored("parent gave up"));
        child.done().await;
        assert_eq!(child.cause().status(), Status::Errored);
    }

    #[tokio::test]
    async fn child_cause_does_not_leak_upward() {
        let parent = Scope::new();
        let child = parent.child();
        child.cancel(Cause::of(Status::TimeoutStart));
        assert!(!parent.is_cancelled());
        assert_eq!(child.cause().status(), Status::TimeoutStart);
    }

    #[tokio::test]
    async fn cancelled_without_cause_reports_cancelled() {
        let scope = Scope::new();
        scope.inner.token.cancel();
        assert_eq!(scope.cause().status(), Status::Cancelled);
    }
}
