// HTTP resilience middleware for axum
// Body limit, recovery, timeout, rate limit and circuit breaker, in that order

//! # Resilience Middleware Stack
//!
//! Each middleware is a plain `async fn` used with
//! [`axum::middleware::from_fn_with_state`], holding its configuration in an
//! `Arc<...Layer>` state. Every one of them consults its [`PathMatcher`] first
//! and passes skipped paths straight through.
//!
//! A request crosses the layers in this order before reaching the handler:
//!
//! ```text
//! request
//!   → body_limit       413 when the body is too large
//!   → recovery         500 when anything below panics
//!   → timeout          installs the deadline Context, 408 if nothing was written
//!   → rate_limit       429 when the client is over its budget
//!   → circuit_breaker  503 while the breaker is open
//!   → handler
//! ```
//!
//! [`ResilienceStack`] builds the layers from [`Settings`] and applies them to
//! a router in that order. Axum runs the most recently added layer first, so
//! `apply` adds them innermost to outermost.
//!
//! ## Rust Learning Notes:
//!
//! ### Middleware as functions
//! axum 0.6 lets any `async fn(State<S>, Request<Body>, Next<Body>) -> Response`
//! act as a tower layer. The `Next` value runs the rest of the stack; not
//! calling it short-circuits the request.
//!
//! ### Panics across layers
//! The circuit breaker and timeout layers catch a panic only to record it and
//! then `resume_unwind` it. The recovery layer is the one place that turns a
//! panic into a response.

use axum::{middleware::from_fn_with_state, Router};
use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::Result;

pub mod body_limit;
pub mod circuit_breaker;
pub mod path_matcher;
pub mod rate_limit;
pub mod recovery;
pub mod response;
pub mod timeout;

pub use body_limit::{body_limit_middleware, BodyLimitLayer, BodyLimitOptions};
pub use circuit_breaker::{circuit_breaker_middleware, CircuitBreakerLayer, CircuitBreakerOptions};
pub use path_matcher::PathMatcher;
pub use rate_limit::{rate_limit_middleware, LimiterBackend, RateLimitLayer, RateLimitOptions};
pub use recovery::{recovery_middleware, RecoveryLayer, RecoveryOptions};
pub use response::ErrorEnvelope;
pub use timeout::{timeout_middleware, TimeoutLayer, TimeoutOptions, Unwritten};

/// The configured set of middleware layers
#[derive(Debug, Default, Clone)]
pub struct ResilienceStack {
    body_limit: Option<Arc<BodyLimitLayer>>,
    recovery: Option<Arc<RecoveryLayer>>,
    timeout: Option<Arc<TimeoutLayer>>,
    rate_limit: Option<Arc<RateLimitLayer>>,
    circuit_breaker: Option<Arc<CircuitBreakerLayer>>,
}

impl ResilienceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled layer from `settings`
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        settings.validate()?;

        let mut stack = Self::new();
        if settings.body_limit.enabled {
            stack = stack.with_body_limit(BodyLimitLayer::new(&settings.body_limit));
        }
        if settings.recovery.enabled {
            stack = stack.with_recovery(RecoveryLayer::new(&settings.recovery));
        }
        if settings.timeout.enabled {
            stack = stack.with_timeout(TimeoutLayer::new(&settings.timeout));
        }
        if settings.rate_limit.enabled {
            stack = stack.with_rate_limit(RateLimitLayer::from_options(&settings.rate_limit).await?);
        }
        if settings.circuit_breaker.enabled {
            stack = stack.with_circuit_breaker(CircuitBreakerLayer::new(
                settings.server.name.clone(),
                &settings.circuit_breaker,
            ));
        }
        Ok(stack)
    }

    pub fn with_body_limit(mut self, layer: BodyLimitLayer) -> Self {
        self.body_limit = Some(Arc::new(layer));
        self
    }

    pub fn with_recovery(mut self, layer: RecoveryLayer) -> Self {
        self.recovery = Some(Arc::new(layer));
        self
    }

    pub fn with_timeout(mut self, layer: TimeoutLayer) -> Self {
        self.timeout = Some(Arc::new(layer));
        self
    }

    pub fn with_rate_limit(mut self, layer: RateLimitLayer) -> Self {
        self.rate_limit = Some(Arc::new(layer));
        self
    }

    pub fn with_circuit_breaker(mut self, layer: CircuitBreakerLayer) -> Self {
        self.circuit_breaker = Some(Arc::new(layer));
        self
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreakerLayer>> {
        self.circuit_breaker.as_ref()
    }

    /// Names of the installed layers, outermost first
    pub fn layer_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.body_limit.is_some() {
            names.push("body_limit");
        }
        if self.recovery.is_some() {
            names.push("recovery");
        }
        if self.timeout.is_some() {
            names.push("timeout");
        }
        if self.rate_limit.is_some() {
            names.push("rate_limit");
        }
        if self.circuit_breaker.is_some() {
            names.push("circuit_breaker");
        }
        names
    }

    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router;
        if let Some(layer) = &self.circuit_breaker {
            router = router.layer(from_fn_with_state(layer.clone(), circuit_breaker_middleware));
        }
        if let Some(layer) = &self.rate_limit {
            router = router.layer(from_fn_with_state(layer.clone(), rate_limit_middleware));
        }
        if let Some(layer) = &self.timeout {
            router = router.layer(from_fn_with_state(layer.clone(), timeout_middleware));
        }
        if let Some(layer) = &self.recovery {
            router = router.layer(from_fn_with_state(layer.clone(), recovery_middleware));
        }
        if let Some(layer) = &self.body_limit {
            router = router.layer(from_fn_with_state(layer.clone(), body_limit_middleware));
        }
        info!(layers = ?self.layer_names(), "resilience middleware installed");
        router
    }
}
