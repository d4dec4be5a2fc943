//! Bearer-key authentication for the status API.
//!
//! When `[server] api_key` is set, every route except `/api/health` requires
//! `Authorization: Bearer <key>`. Without a key the middleware is not
//! installed at all.

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Expected key, carried as a request extension.
#[derive(Clone)]
pub struct ApiKey(pub String);

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// `401` for a missing or non-Bearer header, `403` for a wrong key.
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return reject(StatusCode::INTERNAL_SERVER_ERROR, "API key not configured");
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(provided) = provided else {
        return reject(StatusCode::UNAUTHORIZED, "Missing or invalid Authorization header");
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return reject(StatusCode::FORBIDDEN, "Invalid API key");
    }
    next.run(request).await
}

/// Compare in time proportional to `expected` only.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_match() {
        assert!(constant_time_eq(b"secret", b"secret"));
    }

    #[test]
    fn prefix_and_extension_do_not_match() {
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secret!"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(!constant_time_eq(b"", b"x"));
    }
}
