//! `POST /api/diagnostics`: run the diagnostic suite against the configured bridge.
//!
//! Query parameters:
//! - `format`: `json` (default), `text` or `markdown`
//! - `timeout_secs`: per-test timeout, 1 to 60 (default `[diagnostics] test_timeout_secs`)
//!
//! Runs are serialized; a second request waits for the first to finish.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{error, info};

use super::error_response;
use crate::diagnostics::{run_with_probe, DiagnosticTarget, ReportFormat};
use crate::AppState;

const MAX_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Default, Deserialize)]
pub struct DiagnosticsQuery {
    pub format: Option<String>,
    pub timeout_secs: Option<u64>,
}

pub async fn run(State(state): State<AppState>, Query(query): Query<DiagnosticsQuery>) -> Response {
    let format = match query.format.as_deref().map(str::parse::<ReportFormat>) {
        None => ReportFormat::Json,
        Some(Ok(format)) => format,
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let endpoint = match state.config.endpoint() {
        Ok(endpoint) => endpoint,
        Err(e) => return error_response(StatusCode::CONFLICT, e),
    };
    let timeout = query.timeout_secs.map_or_else(
        || state.config.test_timeout(),
        |secs| Duration::from_secs(secs.clamp(1, MAX_TIMEOUT_SECS)),
    );

    let target = DiagnosticTarget {
        host: endpoint.host,
        port: endpoint.port,
        token: state.config.tunnel.token.clone(),
    };
    info!(host = %target.host, port = target.port, "Running diagnostics");
    let cancel = state.tunnel.orchestrator().shutdown_token().child_token();
    let report = run_with_probe(Arc::clone(&state.probe), &target, timeout, &cancel).await;
    info!(
        score = report.health_score,
        status = report.status.as_str(),
        "Diagnostics finished"
    );

    if format == ReportFormat::Json {
        return Json(report).into_response();
    }
    match report.render(format) {
        Ok(body) => {
            let content_type = if format == ReportFormat::Markdown {
                "text/markdown; charset=utf-8"
            } else {
                "text/plain; charset=utf-8"
            };
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!("Failed to render diagnostic report: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}
