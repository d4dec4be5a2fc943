//! `GET /api/status`: everything the engine knows about the session.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::util::{format_age, now_ms};
use crate::AppState;

const DEFAULT_EVENTS: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    /// Number of recent events to include (default 20).
    pub events: Option<usize>,
}

pub async fn status(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> Json<Value> {
    let orchestrator = state.tunnel.orchestrator();
    let tracker = orchestrator.tracker();
    let now = now_ms();

    let recent_events: Vec<Value> = tracker
        .recent_events(query.events.unwrap_or(DEFAULT_EVENTS))
        .into_iter()
        .map(|e| {
            json!({
                "time": format_age(now.saturating_sub(e.timestamp)),
                "timestamp": e.timestamp,
                "event": e.event_type.as_str(),
                "message": e.message,
                "context": e.context,
            })
        })
        .collect();

    Json(json!({
        "connection": tracker.record(),
        "uptime_secs": tracker.uptime().as_secs(),
        "reconnect_attempts": tracker.reconnect_attempts(),
        "recovering": orchestrator.is_recovering(),
        "network_available": orchestrator.is_network_available(),
        "heartbeat": orchestrator.heartbeat().stats(),
        "quality": state.tunnel.quality().report(),
        "last_error": orchestrator.last_error(),
        "queued_requests": state.tunnel.queued(),
        "recent_events": recent_events,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{body_string, call, get, state};
    use serde_json::Value;

    #[tokio::test]
    async fn reports_record_and_newest_event_first() {
        let s = state(None);
        s.tunnel.orchestrator().connect().await.unwrap();
        let response = call(s.clone(), get("/api/status?events=5")).await;
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();

        assert_eq!(body["connection"]["state"], "connected");
        assert_eq!(body["connection"]["server_url"], "wss://bridge.example:8443/tunnel");
        assert_eq!(body["recent_events"][0]["event"], "connected");
        assert_eq!(body["queued_requests"], 0);
        assert!(body["last_error"].is_null());
        s.tunnel.orchestrator().close("test").await;
    }
}
