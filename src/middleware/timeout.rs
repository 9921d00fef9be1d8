// Per-request deadline propagation
// The handler runs in the request's own task; nothing races it for the response

//! # Timeout Middleware
//!
//! The middleware derives a child [`Context`] with deadline `now + timeout`,
//! installs it in the request extensions and awaits the handler in the same
//! task. There is no spawned task and no `select!` against a timer, so there
//! is never a second writer competing with the handler for the response.
//!
//! After the handler returns, a 408 envelope replaces the response only when
//! both hold:
//!
//! - the context reports [`ContextError::DeadlineExceeded`]
//! - the handler produced nothing, which it signals by returning a response
//!   tagged with [`Unwritten`] (as `ContextError` does)
//!
//! Any other response is the handler's answer and passes through, even an
//! empty `200 OK` that arrives after the deadline.
//!
//! Handlers cooperate by extracting the [`Context`] and awaiting
//! [`Context::done`] next to their own work:
//!
//! ```rust,ignore
//! async fn slow(ctx: Context) -> Result<Json<Value>, ContextError> {
//!     tokio::select! {
//!         reason = ctx.done() => Err(reason),
//!         value = compute() => Ok(Json(value)),
//!     }
//! }
//! ```
//!
//! A handler that ignores the context runs to completion; the middleware
//! cannot stop it.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use super::path_matcher::PathMatcher;
use super::response::ErrorEnvelope;
use crate::context::{Context, ContextError};
use crate::runnable::panic::panic_message;

/// Response extension marking "the handler wrote nothing"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwritten;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutOptions {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub skip_paths: Vec<String>,
    pub skip_path_prefixes: Vec<String>,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 30_000,
            skip_paths: Vec::new(),
            skip_path_prefixes: Vec::new(),
        }
    }
}

impl TimeoutOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.timeout_ms == 0 {
            errors.push("timeout.timeout_ms must be greater than 0".to_string());
        }
        errors
    }
}

#[derive(Debug)]
pub struct TimeoutLayer {
    timeout: Duration,
    matcher: PathMatcher,
}

impl TimeoutLayer {
    pub fn new(options: &TimeoutOptions) -> Self {
        Self {
            timeout: options.timeout(),
            matcher: PathMatcher::new(
                options.skip_paths.iter().cloned(),
                options.skip_path_prefixes.iter().cloned(),
            ),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn is_unwritten(response: &Response) -> bool {
    response.extensions().get::<Unwritten>().is_some()
}

pub async fn timeout_middleware(
    State(layer): State<Arc<TimeoutLayer>>,
    mut request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let path = request.uri().path().to_string();
    if layer.matcher.should_skip(&path) {
        return next.run(request).await;
    }

    let parent = request
        .extensions()
        .get::<Context>()
        .cloned()
        .unwrap_or_default();
    let ctx = parent.with_timeout(layer.timeout);
    request.extensions_mut().insert(ctx.clone());

    let response = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(
                path = %path,
                panic = %panic_message(panic.as_ref()),
                "panic in handler under timeout middleware"
            );
            std::panic::resume_unwind(panic)
        }
    };

    if ctx.err() == Some(ContextError::DeadlineExceeded) && is_unwritten(&response) {
        warn!(path = %path, timeout = ?layer.timeout, "request deadline exceeded");
        return ErrorEnvelope::request_timeout().into_response_with(StatusCode::REQUEST_TIMEOUT);
    }
    response
}

impl IntoResponse for ContextError {
    fn into_response(self) -> Response {
        let mut response = match self {
            ContextError::DeadlineExceeded => {
                ErrorEnvelope::request_timeout().into_response_with(StatusCode::REQUEST_TIMEOUT)
            }
            ContextError::Canceled => ErrorEnvelope::new(49900, "request canceled")
                .into_response_with(StatusCode::SERVICE_UNAVAILABLE),
        };
        response.extensions_mut().insert(Unwritten);
        response
    }
}
