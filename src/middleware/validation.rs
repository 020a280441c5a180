//! Request validation and sanitization.
//!
//! JSON request bodies are buffered, structurally validated (depth, string
//! and array lengths, numeric magnitude), scanned for injection patterns,
//! and HTML-escaped before the sanitized body replaces the original on its
//! way to the handler. Oversized payloads and traversal attempts are
//! rejected before any body is read.

use crate::{error::ApiError, server::AppState};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::warn;

/// Maximum JSON nesting depth.
const MAX_DEPTH: usize = 10;
/// Maximum length of any string value.
const MAX_STRING_LENGTH: usize = 10_000;
/// Maximum number of elements in any array.
const MAX_ARRAY_LENGTH: usize = 100;
/// Maximum length of any object key.
const MAX_KEY_LENGTH: usize = 100;
/// Largest integer magnitude accepted (2^53, the safe interop bound).
const MAX_INTEGER_MAGNITUDE: u64 = 1 << 53;

static SQL_INJECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(union|select|insert|update|delete|drop|create|alter|exec|execute|script|javascript|eval)\b",
    )
    .expect("static regex")
});

static XSS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(<script|<iframe|javascript:|onerror=|onload=|onclick=|<img\s+src)")
        .expect("static regex")
});

/// Escape the HTML-significant characters in a string leaf.
fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Validate and sanitize a parsed JSON document in place.
///
/// String leaves come back HTML-escaped; structural violations and injection
/// patterns abort with a validation error naming the offending path.
pub fn sanitize_json(value: &mut Value) -> Result<(), ApiError> {
    sanitize_node(value, 0, "$")
}

fn sanitize_node(value: &mut Value, depth: usize, path: &str) -> Result<(), ApiError> {
    if depth > MAX_DEPTH {
        return Err(ApiError::Validation(format!(
            "JSON nesting exceeds maximum depth of {} at {}",
            MAX_DEPTH, path
        )));
    }
    match value {
        Value::String(s) => {
            if s.len() > MAX_STRING_LENGTH {
                return Err(ApiError::Validation(format!(
                    "string at {} exceeds maximum length of {}",
                    path, MAX_STRING_LENGTH
                )));
            }
            if SQL_INJECTION.is_match(s) {
                warn!("sql injection pattern detected at {}", path);
                return Err(ApiError::Validation(format!(
                    "potentially malicious content detected at {}",
                    path
                )));
            }
            if XSS_PATTERN.is_match(s) {
                warn!("xss pattern detected at {}", path);
                return Err(ApiError::Validation(format!(
                    "potentially malicious content detected at {}",
                    path
                )));
            }
            *s = escape_html(s);
        }
        Value::Number(n) => {
            // unsigned_abs: i64::MIN is valid JSON and must not overflow;
            // values above i64::MAX parse as u64 and are checked separately.
            let magnitude = if let Some(i) = n.as_i64() {
                Some(i.unsigned_abs())
            } else {
                n.as_u64()
            };
            if let Some(m) = magnitude {
                if m > MAX_INTEGER_MAGNITUDE {
                    return Err(ApiError::Validation(format!(
                        "integer at {} exceeds safe magnitude",
                        path
                    )));
                }
            }
        }
        Value::Array(items) => {
            if items.len() > MAX_ARRAY_LENGTH {
                return Err(ApiError::Validation(format!(
                    "array at {} exceeds maximum length of {}",
                    path, MAX_ARRAY_LENGTH
                )));
            }
            for (i, item) in items.iter_mut().enumerate() {
                sanitize_node(item, depth + 1, &format!("{}[{}]", path, i))?;
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if key.len() > MAX_KEY_LENGTH {
                    return Err(ApiError::Validation(format!(
                        "object key at {} exceeds maximum length of {}",
                        path, MAX_KEY_LENGTH
                    )));
                }
                sanitize_node(item, depth + 1, &format!("{}.{}", path, key))?;
            }
        }
        Value::Null | Value::Bool(_) => {}
    }
    Ok(())
}

/// Strip path separators and traversal sequences from an uploaded filename,
/// keeping only the final component.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .replace("..", "");
    let cleaned: String = base
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    if cleaned.trim().is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Validate an API key's shape: provider prefix, plausible length, and the
/// key alphabet. The key value itself is never checked against a registry.
pub fn validate_api_key(key: &str) -> bool {
    key.starts_with("sk-")
        && key.len() >= 20
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn has_traversal(path: &str) -> bool {
    path.contains("..") || path.contains("//")
}

fn is_json_body(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false)
}

/// Axum layer enforcing size, path, and body-content validation.
///
/// Streaming endpoints still get size and path checks, but their bodies are
/// validated by the handler rather than buffered here.
pub async fn validation_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path().to_string();

    if has_traversal(&path) {
        warn!("path traversal attempt: {}", path);
        return Err(ApiError::Validation("invalid request path".to_string()));
    }

    let max_bytes = state.config.max_upload_size_bytes();
    if let Some(length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > max_bytes {
            return Err(ApiError::PayloadTooLarge(format!(
                "request body exceeds {} bytes",
                max_bytes
            )));
        }
    }

    let buffer_body = matches!(
        req.method(),
        &Method::POST | &Method::PUT | &Method::PATCH
    ) && is_json_body(&req)
        && !path.ends_with("/stream");

    if !buffer_body {
        return Ok(next.run(req).await);
    }

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, max_bytes)
        .await
        .map_err(|_| ApiError::PayloadTooLarge("request body too large".to_string()))?;

    let mut value: Value = serde_json::from_slice(&bytes)
        .map_err(|_| ApiError::Validation("Invalid JSON".to_string()))?;
    sanitize_json(&mut value)?;

    let sanitized = serde_json::to_vec(&value)
        .map_err(|e| ApiError::Validation(format!("failed to re-encode body: {}", e)))?;

    let mut req = Request::from_parts(parts, Body::from(sanitized.clone()));
    req.headers_mut().insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(sanitized.len() as u64),
    );

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn depth_ten_accepted_eleven_rejected() {
        // Ten nested arrays inside the root object: depth 10 exactly.
        let mut ok = json!({"a": [[[[[[[[["x"]]]]]]]]]});
        assert!(sanitize_json(&mut ok).is_ok());

        let mut too_deep = json!({"a": [[[[[[[[[["x"]]]]]]]]]]});
        assert!(sanitize_json(&mut too_deep).is_err());
    }

    #[test]
    fn long_string_rejected() {
        let mut value = json!({"message": "a".repeat(MAX_STRING_LENGTH + 1)});
        assert!(sanitize_json(&mut value).is_err());
        let mut fits = json!({"message": "a".repeat(MAX_STRING_LENGTH)});
        assert!(sanitize_json(&mut fits).is_ok());
    }

    #[test]
    fn oversized_array_and_key_rejected() {
        let mut arr = json!({ "items": vec![0; MAX_ARRAY_LENGTH + 1] });
        assert!(sanitize_json(&mut arr).is_err());

        let mut obj = json!({ ("k".repeat(MAX_KEY_LENGTH + 1)): 1 });
        assert!(sanitize_json(&mut obj).is_err());
    }

    #[test]
    fn unsafe_integer_rejected() {
        let mut value = json!({"n": MAX_INTEGER_MAGNITUDE + 1});
        assert!(sanitize_json(&mut value).is_err());
        let mut neg = json!({"n": -(MAX_INTEGER_MAGNITUDE as i64 + 1)});
        assert!(sanitize_json(&mut neg).is_err());
        let mut fits = json!({"n": MAX_INTEGER_MAGNITUDE});
        assert!(sanitize_json(&mut fits).is_ok());
        let mut neg_fits = json!({"n": -(MAX_INTEGER_MAGNITUDE as i64)});
        assert!(sanitize_json(&mut neg_fits).is_ok());
    }

    #[test]
    fn integers_beyond_i64_are_rejected() {
        // 2^63 does not fit i64; it parses as u64 and must still be caught.
        let mut huge = json!({"n": 9_223_372_036_854_775_808u64});
        assert!(sanitize_json(&mut huge).is_err());
        let mut max = json!({"n": u64::MAX});
        assert!(sanitize_json(&mut max).is_err());
    }

    #[test]
    fn i64_min_is_rejected_without_overflow() {
        let mut value = json!({"n": i64::MIN});
        assert!(sanitize_json(&mut value).is_err());
    }

    #[test]
    fn injection_patterns_rejected() {
        let mut sql = json!({"q": "1; DROP TABLE users"});
        assert!(sanitize_json(&mut sql).is_err());

        let mut xss = json!({"q": "<script>alert(1)</script>"});
        assert!(sanitize_json(&mut xss).is_err());

        let mut handler = json!({"q": "x onerror=steal()"});
        assert!(sanitize_json(&mut handler).is_err());
    }

    #[test]
    fn string_leaves_are_escaped() {
        let mut value = json!({"q": "a < b & c > 'd'"});
        sanitize_json(&mut value).unwrap();
        assert_eq!(value["q"], "a &lt; b &amp; c &gt; &#x27;d&#x27;");
    }

    #[test]
    fn benign_prose_passes_unchanged() {
        let mut value = json!({"message": "What does chapter 3 say about budgets?"});
        sanitize_json(&mut value).unwrap();
        assert_eq!(value["message"], "What does chapter 3 say about budgets?");
    }

    #[test]
    fn filename_sanitization() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("dir/sub\\evil?.pdf"), "evil.pdf");
        assert_eq!(sanitize_filename("///"), "upload");
    }

    #[test]
    fn api_key_shape() {
        assert!(validate_api_key("sk-0123456789abcdef012345"));
        assert!(!validate_api_key("sk-short"));
        assert!(!validate_api_key("pk-0123456789abcdef012345"));
        assert!(!validate_api_key(""));
    }

    #[test]
    fn traversal_detection() {
        assert!(has_traversal("/api/v1/../admin"));
        assert!(has_traversal("/api//v1/chat"));
        assert!(!has_traversal("/api/v1/chat/message"));
    }
}
