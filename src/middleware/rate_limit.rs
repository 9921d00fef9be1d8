// Rate limiting middleware
// Resolves the client identity, asks the configured limiter, answers 429 on denial

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::path_matcher::PathMatcher;
use super::response::{with_retry_after, ErrorEnvelope};
use crate::context::Context;
use crate::resilience::client_ip::{ClientIdentity, ProxyRule};
use crate::resilience::limiter::{
    DistributedRateLimiter, MemoryRateLimiter, RateLimiter, RedisSlidingWindowStore,
};
use crate::{BulwarkError, Result};

pub const DEFAULT_FALLBACK_KEY: &str = "unknown";

/// Called with the client identity whenever a request is denied
pub type LimitHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterBackend {
    Memory,
    Redis,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOptions {
    pub enabled: bool,
    pub backend: LimiterBackend,
    /// Requests admitted per window and key
    pub limit: u64,
    pub window_ms: u64,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub trust_proxy_headers: bool,
    /// Literal addresses or CIDR blocks
    pub trusted_proxies: Vec<String>,
    /// Admit requests when the limiter backend fails
    pub fail_open: bool,
    /// Identity used when the socket peer address is unavailable
    pub fallback_key: String,
    pub skip_paths: Vec<String>,
    pub skip_path_prefixes: Vec<String>,
    #[serde(skip)]
    pub on_limit_reached: Option<LimitHook>,
}

impl fmt::Debug for RateLimitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitOptions")
            .field("enabled", &self.enabled)
            .field("backend", &self.backend)
            .field("limit", &self.limit)
            .field("window_ms", &self.window_ms)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("key_prefix", &self.key_prefix)
            .field("trust_proxy_headers", &self.trust_proxy_headers)
            .field("trusted_proxies", &self.trusted_proxies)
            .field("fail_open", &self.fail_open)
            .field("fallback_key", &self.fallback_key)
            .field("skip_paths", &self.skip_paths)
            .field("skip_path_prefixes", &self.skip_path_prefixes)
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .finish()
    }
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: LimiterBackend::Memory,
            limit: 100,
            window_ms: 60_000,
            redis_url: None,
            key_prefix: crate::resilience::limiter::distributed::DEFAULT_KEY_PREFIX.to_string(),
            trust_proxy_headers: false,
            trusted_proxies: Vec::new(),
            fail_open: true,
            fallback_key: DEFAULT_FALLBACK_KEY.to_string(),
            skip_paths: Vec::new(),
            skip_path_prefixes: Vec::new(),
            on_limit_reached: None,
        }
    }
}

impl RateLimitOptions {
    pub fn with_limit(mut self, limit: u64, window: Duration) -> Self {
        self.limit = limit;
        self.window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_redis(mut self, url: impl Into<String>) -> Self {
        self.backend = LimiterBackend::Redis;
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_trusted_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trust_proxy_headers = true;
        self.trusted_proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_fallback_key(mut self, key: impl Into<String>) -> Self {
        self.fallback_key = key.into();
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

    pub fn with_on_limit_reached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(hook));
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.limit == 0 {
            errors.push("rate_limit.limit must be greater than 0".to_string());
        }
        if self.window_ms == 0 {
            errors.push("rate_limit.window_ms must be greater than 0".to_string());
        }
        if self.fallback_key.is_empty() {
            errors.push("rate_limit.fallback_key must not be empty".to_string());
        }
        if self.backend == LimiterBackend::Redis
            && self.redis_url.as_deref().map_or(true, str::is_empty)
        {
            errors.push("rate_limit.redis_url is required for the redis backend".to_string());
        }
        for proxy in &self.trusted_proxies {
            if let Err(err) = proxy.parse::<ProxyRule>() {
                errors.push(format!("rate_limit.trusted_proxies: {}", err));
            }
        }
        errors
    }

    fn identity(&self) -> Result<ClientIdentity> {
        if !self.trust_proxy_headers {
            return Ok(ClientIdentity::peer_only());
        }
        ClientIdentity::trusting(&self.trusted_proxies).map_err(BulwarkError::Validation)
    }
}

pub struct RateLimitLayer {
    limiter: Arc<dyn RateLimiter>,
    identity: ClientIdentity,
    matcher: PathMatcher,
    fail_open: bool,
    fallback_key: String,
    on_limit_reached: Option<LimitHook>,
    retry_after_secs: u64,
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("identity", &self.identity)
            .field("matcher", &self.matcher)
            .field("fail_open", &self.fail_open)
            .finish()
    }
}

impl RateLimitLayer {
    /// Wrap an existing limiter with the middleware policy from `options`
    pub fn new(limiter: Arc<dyn RateLimiter>, options: &RateLimitOptions) -> Result<Self> {
        Ok(Self {
            limiter,
            identity: options.identity()?,
            matcher: PathMatcher::new(
                options.skip_paths.iter().cloned(),
                options.skip_path_prefixes.iter().cloned(),
            ),
            fail_open: options.fail_open,
            fallback_key: options.fallback_key.clone(),
            on_limit_reached: options.on_limit_reached.clone(),
            retry_after_secs: options.window().as_secs(),
        })
    }

    /// Build the backend named in `options`, connecting to Redis if needed
    pub async fn from_options(options: &RateLimitOptions) -> Result<Self> {
        let limiter: Arc<dyn RateLimiter> = match options.backend {
            LimiterBackend::Memory => {
                Arc::new(MemoryRateLimiter::new(options.limit, options.window()))
            }
            LimiterBackend::Redis => {
                let url = options.redis_url.as_deref().ok_or_else(|| {
                    BulwarkError::Validation(vec![
                        "rate_limit.redis_url is required for the redis backend".to_string(),
                    ])
                })?;
                let store = RedisSlidingWindowStore::connect(url).await?;
                Arc::new(
                    DistributedRateLimiter::new(Arc::new(store), options.limit, options.window())
                        .with_prefix(options.key_prefix.clone()),
                )
            }
        };
        Self::new(limiter, options)
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    fn client_key(&self, request: &Request<Body>) -> String {
        match request.extensions().get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => self.identity.resolve(&addr.to_string(), request.headers()),
            None => {
                warn!(
                    path = %request.uri().path(),
                    fallback = %self.fallback_key,
                    "peer address unavailable, rate limiting under the fallback key"
                );
                self.fallback_key.clone()
            }
        }
    }

    fn denied(&self, key: &str) -> Response {
        if let Some(hook) = &self.on_limit_reached {
            hook(key);
        }
        let response =
            ErrorEnvelope::rate_limited().into_response_with(StatusCode::TOO_MANY_REQUESTS);
        with_retry_after(response, self.retry_after_secs)
    }
}

pub async fn rate_limit_middleware(
    State(layer): State<Arc<RateLimitLayer>>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let path = request.uri().path().to_string();
    if layer.matcher.should_skip(&path) {
        return next.run(request).await;
    }

    let key = layer.client_key(&request);
    let ctx = request
        .extensions()
        .get::<Context>()
        .cloned()
        .unwrap_or_default();

    match layer.limiter.allow(&ctx, &key).await {
        Ok(true) => {
            debug!(client = %key, path = %path, "request admitted by rate limiter");
            next.run(request).await
        }
        Ok(false) => {
            warn!(client = %key, path = %path, "rate limit exceeded");
            layer.denied(&key)
        }
        Err(err) if layer.fail_open => {
            warn!(client = %key, error = %err, "rate limiter unavailable, admitting request");
            next.run(request).await
        }
        Err(err) => {
            error!(client = %key, error = %err, "rate limiter unavailable, rejecting request");
            layer.denied(&key)
        }
    }
}
