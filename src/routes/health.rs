//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::ConnectionState;
use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// `status` is `ok` while the tunnel is connected with a healthy heartbeat,
/// `degraded` while it is recovering, and `down` otherwise. The HTTP status is
/// always 200 so load balancers only see process liveness.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let orchestrator = state.tunnel.orchestrator();
    let connection = orchestrator.state();
    let heartbeat_healthy = orchestrator.heartbeat().is_healthy();

    let status = if connection == ConnectionState::Connected && heartbeat_healthy {
        "ok"
    } else if orchestrator.is_recovering() || connection == ConnectionState::Reconnecting {
        "degraded"
    } else {
        "down"
    };

    Json(json!({
        "status": status,
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "connection": connection.as_str(),
        "heartbeat_healthy": heartbeat_healthy,
        "reconnect_attempts": orchestrator.tracker().reconnect_attempts(),
    }))
}
