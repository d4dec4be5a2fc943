#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunlink
//!
//! Keeps an agent's tunnel to a bridge server alive and explains it when it
//! is not.
//!
//! ## Subcommands
//!
//! - `tunlink run [--config <path>]`: connect to the bridge, recover from
//!   disconnects, and serve the status API until SIGINT/SIGTERM
//! - `tunlink diagnose --host <h> [--port <p>] [--token <t>]`: run the
//!   diagnostic suite once and print a report
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, graceful shutdown
//! config.rs        TOML + env-var configuration
//! auth.rs          Bearer key middleware, constant-time comparison
//! state.rs         connection state machine and event history
//! reconnect.rs     backoff policy and reconnection cycles
//! heartbeat.rs     ping/pong liveness
//! errors.rs        error taxonomy and categorization
//! recovery/        strategies and the recovery orchestrator
//! metrics/         history, quality estimation, exporters
//! diagnostics/     probe, test runner, report generator
//! tunnel/          WebSocket transport, outbound queue, client loop
//! routes/          status API handlers
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tunlink::config::Config;
use tunlink::diagnostics::{run_with_probe, DiagnosticTarget, ReportFormat, WsProbe, DEFAULT_TEST_TIMEOUT};
use tunlink::{routes, tunnel, AppState};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Tunnel connection resilience and diagnostics.
#[derive(Parser)]
#[command(name = "tunlink", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel agent and the status API.
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Diagnose connectivity to a bridge and print a report.
    Diagnose {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 443)]
        port: u16,
        /// Bearer token. Falls back to `TUNLINK_TOKEN`.
        #[arg(long)]
        token: Option<String>,
        /// Per-test timeout in seconds (default 10).
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// `text`, `json` or `markdown`.
        #[arg(long, default_value = "text")]
        format: String,
        /// Tunnel endpoint path on the bridge.
        #[arg(long, default_value = "/tunnel")]
        path: String,
        /// Use `ws://` instead of `wss://`.
        #[arg(long)]
        plain: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => run_agent(config.as_deref()).await,
        Commands::Diagnose {
            host,
            port,
            token,
            timeout_secs,
            format,
            path,
            plain,
        } => {
            let token = token
                .or_else(|| std::env::var("TUNLINK_TOKEN").ok())
                .unwrap_or_default();
            let target = DiagnosticTarget { host, port, token };
            let timeout = timeout_secs.map_or(DEFAULT_TEST_TIMEOUT, Duration::from_secs);
            diagnose(&target, WsProbe::new(!plain, path), timeout, &format).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("tunlink: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_agent(config_path: Option<&str>) -> Result<ExitCode, BoxError> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tunlink v{} starting", env!("CARGO_PKG_VERSION"));
    if config.server.api_key.is_none() {
        warn!("No API key configured, status API is unauthenticated. Set TUNLINK_API_KEY to protect it");
    }

    let (tunnel, client) = tunnel::build(&config)?;
    let endpoint = config.endpoint()?;
    let state = AppState {
        probe: Arc::new(WsProbe::new(endpoint.tls, endpoint.path)),
        config: Arc::new(config),
        start_time: Instant::now(),
        tunnel: tunnel.clone(),
    };

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Status API listening on {}", state.config.server.listen);

    let client_task = tokio::spawn(client.run());
    let app = routes::router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    tunnel.orchestrator().close("agent shutdown").await;
    match client_task.await {
        Ok(status) => info!(?status, "Tunnel client finished"),
        Err(e) => warn!("Tunnel client task failed: {e}"),
    }
    info!("Goodbye");
    Ok(ExitCode::SUCCESS)
}

async fn diagnose(
    target: &DiagnosticTarget,
    probe: WsProbe,
    timeout: Duration,
    format: &str,
) -> Result<ExitCode, BoxError> {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let format: ReportFormat = format.parse()?;
    let report = run_with_probe(Arc::new(probe), target, timeout, &CancellationToken::new()).await;
    println!("{}", report.render(format)?);

    Ok(if report.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
