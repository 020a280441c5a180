//! Error taxonomy for the gateway.
//!
//! Every failure surfaced to a client goes through [`ApiError`], which maps
//! onto the HTTP status space: validation and auth failures are rejected at
//! the middleware boundary, rate-limit denials carry retry headers, and
//! upstream or internal failures are reduced to a generic message while the
//! full detail is retained by the error tracker and logs.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Error context attached to 5xx responses so the error-tracking layer can
/// record the failure together with the request snapshot it belongs to.
#[derive(Debug, Clone)]
pub struct TrackedError {
    /// Stable error kind, e.g. `upstream_error`.
    pub kind: String,
    /// Full internal message (never sent to the client).
    pub message: String,
    /// Application-level origin frames for fingerprinting.
    pub frames: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed, oversized, or malicious input. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Missing or malformed API key.
    #[error("{0}")]
    Auth(String),

    /// Request body larger than the configured hard cap.
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Per-identity budget exhausted for the current window.
    #[error("rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        limit: u32,
        reset: u64,
        retry_after: u64,
    },

    /// Unknown file id, error id, or similar.
    #[error("{0}")]
    NotFound(String),

    /// Failure from the LLM or embedding collaborator.
    #[error("upstream error: {message}")]
    Upstream { message: String, origin: String },

    /// Anything caught at the outermost boundary.
    #[error("internal error: {message}")]
    Internal { message: String, origin: String },
}

impl ApiError {
    /// Build an upstream error, capturing the construction site so the
    /// tracker can group recurring failures by application-level origin.
    #[track_caller]
    pub fn upstream(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self::Upstream {
            message: message.into(),
            origin: format!("{}:{}", loc.file(), loc.line()),
        }
    }

    /// Build an internal error, capturing the construction site.
    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self::Internal {
            message: message.into(),
            origin: format!("{}:{}", loc.file(), loc.line()),
        }
    }

    /// Stable kind string used in response bodies and error grouping.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Auth(_) => "auth_error",
            Self::PayloadTooLarge(_) => "validation_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::NotFound(_) => "not_found",
            Self::Upstream { .. } => "upstream_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(msg) => error_body(StatusCode::BAD_REQUEST, &msg, "validation_error"),
            ApiError::Auth(msg) => error_body(StatusCode::UNAUTHORIZED, &msg, "auth_error"),
            ApiError::PayloadTooLarge(msg) => {
                error_body(StatusCode::PAYLOAD_TOO_LARGE, &msg, "validation_error")
            }
            ApiError::NotFound(msg) => error_body(StatusCode::NOT_FOUND, &msg, "not_found"),
            ApiError::RateLimited {
                message,
                limit,
                reset,
                retry_after,
            } => {
                let body = Json(json!({
                    "detail": format!("Rate limit exceeded: {}", message),
                    "type": "rate_limit_error",
                    "status_code": 429,
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                let headers = response.headers_mut();
                headers.insert(header::RETRY_AFTER, retry_after.into());
                headers.insert("x-ratelimit-limit", limit.into());
                headers.insert("x-ratelimit-remaining", 0.into());
                headers.insert("x-ratelimit-reset", reset.into());
                response
            }
            ApiError::Upstream { message, origin } => {
                tracing::error!(origin = %origin, "upstream failure: {}", message);
                let mut response = error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred",
                    "upstream_error",
                );
                response.extensions_mut().insert(TrackedError {
                    kind: "upstream_error".to_string(),
                    message,
                    frames: vec![origin],
                });
                response
            }
            ApiError::Internal { message, origin } => {
                tracing::error!(origin = %origin, "internal failure: {}", message);
                let mut response = error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An unexpected error occurred",
                    "internal_error",
                );
                response.extensions_mut().insert(TrackedError {
                    kind: "internal_error".to_string(),
                    message,
                    frames: vec![origin],
                });
                response
            }
        }
    }
}

fn error_body(status: StatusCode, message: &str, kind: &str) -> Response {
    let body = Json(json!({
        "error": {
            "message": message,
            "type": kind,
            "status_code": status.as_u16(),
        }
    }));
    (status, body).into_response()
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::upstream("request timeout - provider did not respond in time")
        } else if err.is_connect() {
            ApiError::upstream("connection failed - unable to reach provider")
        } else if let Some(status) = err.status() {
            ApiError::upstream(format!("provider returned HTTP {}", status.as_u16()))
        } else {
            ApiError::upstream(format!("http client error: {}", err))
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ApiError::Validation("x".into()).kind(), "validation_error");
        assert_eq!(ApiError::upstream("x").kind(), "upstream_error");
        assert_eq!(ApiError::NotFound("x".into()).kind(), "not_found");
    }

    #[test]
    fn upstream_captures_origin() {
        let err = ApiError::upstream("boom");
        match err {
            ApiError::Upstream { origin, .. } => assert!(origin.contains("error.rs")),
            _ => panic!("expected upstream variant"),
        }
    }

    #[test]
    fn rate_limited_response_carries_headers() {
        let response = ApiError::RateLimited {
            message: "50 per minute".into(),
            limit: 50,
            reset: 1_700_000_000,
            retry_after: 60,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");
        assert_eq!(response.headers()["x-ratelimit-limit"], "50");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }
}
