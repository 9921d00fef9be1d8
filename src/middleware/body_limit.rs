// Request body size limiting

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::path_matcher::PathMatcher;
use super::response::ErrorEnvelope;

pub const DEFAULT_MAX_BODY_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyLimitOptions {
    pub enabled: bool,
    /// Largest accepted body in bytes
    pub max_size: u64,
    pub skip_paths: Vec<String>,
    pub skip_path_prefixes: Vec<String>,
}

impl Default for BodyLimitOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: DEFAULT_MAX_BODY_SIZE,
            skip_paths: Vec::new(),
            skip_path_prefixes: Vec::new(),
        }
    }
}

impl BodyLimitOptions {
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
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

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_size == 0 {
            errors.push("body_limit.max_size must be greater than 0".to_string());
        }
        errors
    }
}

/// Shared state for [`body_limit_middleware`]
#[derive(Debug)]
pub struct BodyLimitLayer {
    max_size: u64,
    matcher: PathMatcher,
}

impl BodyLimitLayer {
    pub fn new(options: &BodyLimitOptions) -> Self {
        Self {
            max_size: options.max_size,
            matcher: PathMatcher::new(
                options.skip_paths.iter().cloned(),
                options.skip_path_prefixes.iter().cloned(),
            ),
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn too_large(&self) -> Response {
        ErrorEnvelope::too_large(self.max_size).into_response_with(StatusCode::PAYLOAD_TOO_LARGE)
    }
}

fn declared_length(request: &Request<Body>) -> Option<u64> {
    request
        .headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Rejects bodies larger than the configured size with 413.
///
/// A declared `Content-Length` is checked before the handler runs. Bodies
/// without one are buffered up to the limit and handed on as a fresh body.
pub async fn body_limit_middleware(
    State(layer): State<Arc<BodyLimitLayer>>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let path = request.uri().path().to_string();
    if layer.matcher.should_skip(&path) {
        return next.run(request).await;
    }

    if let Some(length) = declared_length(&request) {
        if length > layer.max_size {
            warn!(path = %path, length, max = layer.max_size, "request body too large");
            return layer.too_large();
        }
        // hyper stops reading at the declared length
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let limited = http_body::Limited::new(body, layer.max_size as usize);
    match hyper::body::to_bytes(limited).await {
        Ok(bytes) => {
            debug!(path = %path, size = bytes.len(), "buffered request body");
            next.run(Request::from_parts(parts, Body::from(bytes))).await
        }
        Err(err) if err.downcast_ref::<http_body::LengthLimitError>().is_some() => {
            warn!(path = %path, max = layer.max_size, "request body exceeded limit while reading");
            layer.too_large()
        }
        Err(err) => {
            warn!(path = %path, error = %err, "failed to read request body");
            ErrorEnvelope::new(40000, "failed to read request body")
                .with_type("invalid_request_error")
                .into_response_with(StatusCode::BAD_REQUEST)
        }
    }
}
