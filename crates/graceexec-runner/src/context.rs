//! Cancellation context
//!
//! A [`Context`] is cancelled explicitly or by reaching its deadline. Children
//! observe their parent's cancellation and never outlive its deadline. The
//! first reason a context ends is the one it keeps reporting.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`Context`] ended.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<ContextError>,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn err(&self) -> Option<ContextError> {
        if let Some(cause) = self.cause.get() {
            return Some(*cause);
        }

        let inherited = self.parent.as_ref().and_then(|parent| parent.err());
        let cause = inherited.or_else(|| {
            self.deadline
                .filter(|deadline| Instant::now() >= *deadline)
                .map(|_| ContextError::DeadlineExceeded)
        })?;

        // Another thread may have recorded a cause in the meantime; keep theirs.
        let _ = self.cause.set(cause);
        self.cause.get().copied()
    }
}

/// A cloneable cancellation signal with an optional deadline.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A context that ends only when cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::root(None)
    }

    /// A context that ends after `timeout`, or earlier if cancelled.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::root(Some(Instant::now() + timeout))
    }

    /// A context that ends at `deadline`, or earlier if cancelled.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::root(Some(deadline))
    }

    fn root(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                deadline,
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// A context cancelled together with `self` that can also be cancelled
    /// on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        self.derive(None)
    }

    /// Like [`Context::child`], with its own timeout. The effective deadline
    /// is the earlier of the parent's and the child's.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.derive(Some(Instant::now() + timeout))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let deadline = match (self.inner.deadline, deadline) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                deadline,
                cause: OnceLock::new(),
                parent: Some(Arc::clone(&self.inner)),
            }),
        }
    }

    /// Cancel this context and every context derived from it. A deadline
    /// that already passed stays the recorded cause.
    pub fn cancel(&self) {
        let _ = self.inner.err();
        let _ = self.inner.cause.set(ContextError::Canceled);
        self.inner.token.cancel();
    }

    /// The instant this context expires, if it has a deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// The reason this context ended, or `None` while it is still live.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        self.inner.err()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.inner.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.inner.token.cancelled().await,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
