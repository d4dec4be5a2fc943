#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! tunlink: connection resilience and diagnostics for a bridge tunnel.
//!
//! The engine keeps one logical session to a bridge server alive:
//! - `state`: connection lifecycle, transition table, event history
//! - `reconnect`: exponential backoff with jitter
//! - `heartbeat`: ping/pong liveness with a latched loss signal
//! - `errors`: taxonomy and categorization of raw failures
//! - `recovery`: per-category strategies and the orchestrator tying it together
//! - `metrics`: request/connection history, quality estimation, exporters
//! - `diagnostics`: on-demand test suite with health scoring
//!
//! Around it sit the agent pieces:
//! - `tunnel`: WebSocket transport, outbound queue and client loop
//! - `config`: configuration loading
//! - `auth`: API key middleware for the status API
//! - `routes`: status API handlers

pub mod auth;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod heartbeat;
pub mod metrics;
pub mod reconnect;
pub mod recovery;
pub mod routes;
pub mod state;
pub mod traits;
pub mod tunnel;
pub mod util;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Instant;

pub use config::Config;
pub use errors::{categorize, CategorizedError, TransportError};
pub use recovery::{ConnectionRecoveryOrchestrator, RecoveryStatus};
pub use state::{ConnectionState, ConnectionStateTracker};
pub use tunnel::TunnelHandle;

use diagnostics::DiagnosticProbe;

/// Shared application state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// When the agent started (for uptime).
    pub start_time: Instant,
    pub tunnel: TunnelHandle,
    /// Probe used by `POST /api/diagnostics`.
    pub probe: Arc<dyn DiagnosticProbe>,
}
