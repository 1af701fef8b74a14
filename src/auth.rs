use axum::http::HeaderMap;

use crate::error::ApiError;

/// Lifecycle ingestion is protected by a shared secret in the `access-token`
/// header. A missing or mismatched token rejects the request before any store
/// access.
pub fn require_token(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    match headers.get("access-token").and_then(|v| v.to_str().ok()) {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}
