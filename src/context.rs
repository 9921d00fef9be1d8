// Request and invocation context
// Carries cancellation and an optional deadline through handlers and runnables

//! # Context
//!
//! [`Context`] is the cooperative cancellation handle passed to every
//! runnable, limiter and lifecycle call, and installed on every request by the
//! timeout middleware. It combines two things:
//!
//! - a [`CancellationToken`] that fires when someone calls [`Context::cancel`]
//!   on this context or any ancestor
//! - an optional deadline, inherited by children and only ever tightened
//!
//! Nothing is interrupted when a deadline passes. Callees are expected to
//! check [`Context::err`] or await [`Context::done`] at their suspension
//! points and return promptly.
//!
//! ## Rust Learning Notes:
//!
//! ### Cheap clones
//! `Context` is `Clone`; a clone shares the same token and deadline. Futures
//! that must be `'static` (spawned tasks, boxed streams) take an owned clone.
//!
//! ### Extracting in handlers
//! `Context` implements axum's `FromRequestParts`, so a handler can take it as
//! an argument. Without the timeout middleware it extracts as
//! [`Context::background`].

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context that is never done unless cancelled
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Child that can be cancelled independently of its parent
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Child whose deadline is the earlier of the parent's and `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ContextError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Cancellation token shared with this context, for `select!` loops
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Context
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Context>()
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_never_done() {
        let ctx = Context::background();
        assert_eq!(ctx.err(), None);
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        assert_eq!(ctx.err(), None);

        let reason = ctx.done().await;
        assert_eq!(reason, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.with_cancel();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        child.cancel();
        assert_eq!(grandchild.done().await, ContextError::Canceled);
        assert_eq!(child.err(), Some(ContextError::Canceled));
        assert_eq!(parent.err(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_cannot_extend_parent_deadline() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(10));
        assert_eq!(child.deadline(), parent.deadline());

        tokio::time::sleep(Duration::from_millis(11)).await;
        assert_eq!(child.err(), Some(ContextError::DeadlineExceeded));
    }
}
