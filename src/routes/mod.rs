//! Status API route handlers.
//!
//! | Method | Path               | Auth | Description                               |
//! |--------|--------------------|------|-------------------------------------------|
//! | GET    | `/api/health`      | No   | Liveness probe                            |
//! | GET    | `/api/status`      | Yes  | Session record, events, heartbeat, quality |
//! | GET    | `/api/metrics`     | Yes  | Metrics export (`?format=&window_secs=`)  |
//! | POST   | `/api/diagnostics` | Yes  | Run the diagnostic suite against the bridge |
//!
//! "Yes" applies only when `[server] api_key` is set.

pub mod diagnostics;
pub mod health;
pub mod metrics;
pub mod status;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::AppState;

/// Build the full status API.
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/api/health", get(health::health));

    let mut authed = Router::new()
        .route("/api/status", get(status::status))
        .route("/api/metrics", get(metrics::metrics))
        .route(
            "/api/diagnostics",
            post(diagnostics::run).layer(ConcurrencyLimitLayer::new(1)),
        );
    if let Some(key) = state.config.server.api_key.clone() {
        authed = authed
            .layer(middleware::from_fn(auth::require_api_key))
            .layer(Extension(ApiKey(key)));
    }

    Router::new()
        .merge(public)
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn error_response(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}
