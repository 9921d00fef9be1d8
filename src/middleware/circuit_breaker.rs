// Circuit breaker middleware
// Responses at or above the error threshold and handler panics count as failures

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::path_matcher::PathMatcher;
use super::response::{with_retry_after, ErrorEnvelope};
use crate::resilience::breaker::{BreakerPolicy, CallError, CircuitBreaker, Rejection};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOptions {
    pub enabled: bool,
    pub max_failures: u32,
    /// Time spent Open before a probe is admitted
    pub timeout_ms: u64,
    pub half_open_max_calls: u32,
    /// Responses with a status at or above this count as failures
    pub error_threshold: u16,
    pub skip_paths: Vec<String>,
    pub skip_path_prefixes: Vec<String>,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: 5,
            timeout_ms: 60_000,
            half_open_max_calls: 1,
            error_threshold: 500,
            skip_paths: Vec::new(),
            skip_path_prefixes: Vec::new(),
        }
    }
}

impl CircuitBreakerOptions {
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn with_error_threshold(mut self, status: u16) -> Self {
        self.error_threshold = status;
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

    pub fn with_skip_path_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_path_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            max_failures: self.max_failures,
            timeout: Duration::from_millis(self.timeout_ms),
            half_open_max_calls: self.half_open_max_calls,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_failures == 0 {
            errors.push("circuit_breaker.max_failures must be greater than 0".to_string());
        }
        if self.timeout_ms == 0 {
            errors.push("circuit_breaker.timeout_ms must be greater than 0".to_string());
        }
        if self.half_open_max_calls == 0 {
            errors.push("circuit_breaker.half_open_max_calls must be greater than 0".to_string());
        }
        if !(400..=599).contains(&self.error_threshold) {
            errors.push(format!(
                "circuit_breaker.error_threshold must be between 400 and 599, got {}",
                self.error_threshold
            ));
        }
        errors
    }
}

#[derive(Debug)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
    error_threshold: u16,
    matcher: PathMatcher,
}

impl CircuitBreakerLayer {
    pub fn new(name: impl Into<String>, options: &CircuitBreakerOptions) -> Self {
        Self::with_breaker(
            Arc::new(CircuitBreaker::new(name, options.policy())),
            options,
        )
    }

    /// Share one breaker between several routers
    pub fn with_breaker(breaker: Arc<CircuitBreaker>, options: &CircuitBreakerOptions) -> Self {
        Self {
            breaker,
            error_threshold: options.error_threshold,
            matcher: PathMatcher::new(
                options.skip_paths.iter().cloned(),
                options.skip_path_prefixes.iter().cloned(),
            ),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

/// The downstream response was at or above the error threshold
struct ExecutionFailed(Response);

pub async fn circuit_breaker_middleware(
    State(layer): State<Arc<CircuitBreakerLayer>>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let path = request.uri().path().to_string();
    if layer.matcher.should_skip(&path) {
        return next.run(request).await;
    }

    let threshold = layer.error_threshold;
    let outcome = layer
        .breaker
        .call(async move {
            let response = next.run(request).await;
            if response.status().as_u16() >= threshold {
                Err(ExecutionFailed(response))
            } else {
                Ok(response)
            }
        })
        .await;

    match outcome {
        Ok(response) => response,
        Err(CallError::Failed(ExecutionFailed(response))) => response,
        Err(CallError::Rejected(rejection)) => {
            warn!(
                breaker = %layer.breaker.name(),
                path = %path,
                reason = %rejection,
                "request rejected by circuit breaker"
            );
            let response = ErrorEnvelope::service_unavailable()
                .into_response_with(StatusCode::SERVICE_UNAVAILABLE);
            match rejection {
                Rejection::Open { retry_after } => {
                    with_retry_after(response, retry_after.as_secs_f64().ceil() as u64)
                }
                Rejection::HalfOpenFull => response,
            }
        }
    }
}
