// JSON error envelope rendered by the admission middlewares

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

pub const CODE_REQUEST_TIMEOUT: u32 = 40800;
pub const CODE_REQUEST_TOO_LARGE: u32 = 41300;
pub const CODE_RATE_LIMITED: u32 = 42900;
pub const CODE_INTERNAL: u32 = 50000;
pub const CODE_SERVICE_UNAVAILABLE: u32 = 50300;

/// Body of every error response produced by the middleware stack
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    /// Business error code
    pub code: u32,

    /// Human readable message
    pub message: String,

    /// Error type (if applicable)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            error_type: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn too_large(max_bytes: u64) -> Self {
        Self::new(
            CODE_REQUEST_TOO_LARGE,
            format!("request body exceeds the limit of {} bytes", max_bytes),
        )
        .with_type("request_too_large")
    }

    pub fn rate_limited() -> Self {
        Self::new(CODE_RATE_LIMITED, "rate limit exceeded").with_type("rate_limit_error")
    }

    pub fn service_unavailable() -> Self {
        Self::new(
            CODE_SERVICE_UNAVAILABLE,
            "service temporarily unavailable, circuit breaker is open",
        )
        .with_type("service_unavailable")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CODE_INTERNAL, message).with_type("internal_error")
    }

    pub fn request_timeout() -> Self {
        Self::new(CODE_REQUEST_TIMEOUT, "request timeout")
    }

    pub fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

/// Attach a `Retry-After` header in whole seconds, rounded up
pub(crate) fn with_retry_after(mut response: Response, secs: u64) -> Response {
    if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::to_value(ErrorEnvelope::rate_limited()).unwrap();
        assert_eq!(json["code"], 42900);
        assert_eq!(json["message"], "rate limit exceeded");
        assert_eq!(json["type"], "rate_limit_error");

        let json = serde_json::to_value(ErrorEnvelope::request_timeout()).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 2);
    }
}
