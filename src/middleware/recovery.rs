// Panic recovery for HTTP handlers

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

use super::path_matcher::PathMatcher;
use super::response::ErrorEnvelope;
use crate::config::is_production;
use crate::runnable::panic::panic_message;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryOptions {
    pub enabled: bool,
    /// Include the stack trace in responses (never in production)
    pub enable_stack_trace: bool,
    pub skip_paths: Vec<String>,
    pub skip_path_prefixes: Vec<String>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_stack_trace: false,
            skip_paths: Vec::new(),
            skip_path_prefixes: Vec::new(),
        }
    }
}

impl RecoveryOptions {
    pub fn with_stack_trace(mut self, enabled: bool) -> Self {
        self.enable_stack_trace = enabled;
        self
    }

    pub fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug)]
pub struct RecoveryLayer {
    show_stack: bool,
    matcher: PathMatcher,
}

impl RecoveryLayer {
    /// Production mode is read from the environment once, here.
    pub fn new(options: &RecoveryOptions) -> Self {
        Self::with_environment(options, is_production())
    }

    pub fn with_environment(options: &RecoveryOptions, production: bool) -> Self {
        Self {
            show_stack: options.enable_stack_trace && !production,
            matcher: PathMatcher::new(
                options.skip_paths.iter().cloned(),
                options.skip_path_prefixes.iter().cloned(),
            ),
        }
    }

    pub fn shows_stack(&self) -> bool {
        self.show_stack
    }
}

/// Converts a handler panic into a 500 envelope
pub async fn recovery_middleware(
    State(layer): State<Arc<RecoveryLayer>>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let path = request.uri().path().to_string();
    if layer.matcher.should_skip(&path) {
        return next.run(request).await;
    }
    let method = request.method().clone();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let value = panic_message(panic.as_ref());
            let stack = Backtrace::force_capture().to_string();
            error!(
                method = %method,
                path = %path,
                panic = %value,
                stack = %stack,
                "recovered from handler panic"
            );

            let message = if layer.show_stack {
                format!("internal server error: {}\n{}", value, stack)
            } else {
                "internal server error".to_string()
            };
            ErrorEnvelope::internal(message).into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
