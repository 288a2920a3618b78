//! Client credential checks for `/ws` (query token) and `/api` (bearer header).

use axum::http::{header, HeaderMap};

/// True if `provided` matches the configured credential. No credential configured rejects everyone.
pub fn validate_ws_token(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) if !expected.is_empty() => {
            constant_time_eq(expected.as_bytes(), provided.as_bytes())
        }
        _ => false,
    }
}

/// True if the request carries `Authorization: Bearer <expected>`.
pub fn validate_bearer(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    validate_ws_token(expected, provided)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
