//! `GET /api/metrics?format=&window_secs=`

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::error;

use super::error_response;
use crate::metrics::{ExportFormat, MetricsExporter};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    /// `prometheus` (default), `json`, `json-pretty` or `csv`.
    pub format: Option<String>,
    /// Aggregate only the last N seconds. Absent or 0 means all history.
    pub window_secs: Option<u64>,
}

pub async fn metrics(State(state): State<AppState>, Query(query): Query<MetricsQuery>) -> Response {
    let format = match query.format.as_deref().map(str::parse::<ExportFormat>) {
        None => ExportFormat::default(),
        Some(Ok(format)) => format,
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let window = query
        .window_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    let snapshot = state.tunnel.metrics().get_metrics(window);
    match MetricsExporter::export(&snapshot, format) {
        Ok(body) => ([(header::CONTENT_TYPE, format.content_type())], body).into_response(),
        Err(e) => {
            error!("Metrics export failed: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{body_string, call, get, state};
    use axum::http::{header, StatusCode};

    #[tokio::test]
    async fn prometheus_by_default() {
        let s = state(None);
        s.tunnel.metrics().record_request(12.0, true, None);
        s.tunnel.metrics().record_request(30.0, false, Some("NET_TIMEOUT"));
        let response = call(s, get("/api/metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let body = body_string(response).await;
        assert!(body.contains("tunlink_requests_total 2"));
        assert!(body.contains(r#"tunlink_errors_total{type="NET_TIMEOUT"} 1"#));
    }

    #[tokio::test]
    async fn csv_format_and_window() {
        let s = state(None);
        s.tunnel.metrics().record_request(5.0, true, None);
        let response = call(s, get("/api/metrics?format=csv&window_secs=60")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.starts_with("metric,value"));
    }

    #[tokio::test]
    async fn unknown_format_is_bad_request() {
        let response = call(state(None), get("/api/metrics?format=xml")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
