//! On-demand connection diagnostics, independent of the live tunnel.

pub mod probe;
pub mod report;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use probe::{DiagnosticProbe, DiagnosticSession, WsProbe};
pub use report::{DiagnosticReport, DiagnosticReportGenerator, HealthStatus, RenderError, ReportFormat};
pub use runner::{DiagnosticTarget, DiagnosticTestRunner, TestName, TestResult, TestStatus};

use crate::util::duration_ms;

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the full suite with `probe` and score the result.
pub async fn run_with_probe(
    probe: Arc<dyn DiagnosticProbe>,
    target: &DiagnosticTarget,
    test_timeout: Duration,
    cancel: &CancellationToken,
) -> DiagnosticReport {
    let started = Instant::now();
    let results = DiagnosticTestRunner::new(probe, test_timeout)
        .run(target, cancel)
        .await;
    DiagnosticReportGenerator::generate(target, results, duration_ms(started.elapsed()))
}

/// Diagnose `host:port` over a TLS WebSocket at the default tunnel path.
pub async fn run_diagnostics(
    host: &str,
    port: u16,
    token: &str,
    timeout: Option<Duration>,
) -> DiagnosticReport {
    let target = DiagnosticTarget {
        host: host.to_string(),
        port,
        token: token.to_string(),
    };
    run_with_probe(
        Arc::new(WsProbe::default()),
        &target,
        timeout.unwrap_or(DEFAULT_TEST_TIMEOUT),
        &CancellationToken::new(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::runner::fake::FakeProbe;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scenario_transport_down() {
        let target = DiagnosticTarget {
            host: "bridge.example".into(),
            port: 443,
            token: "opaque-token-0123456789".into(),
        };
        let probe = FakeProbe {
            tcp_ok: false,
            ..FakeProbe::default()
        };
        let report = run_with_probe(
            Arc::new(probe),
            &target,
            DEFAULT_TEST_TIMEOUT,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(report.health_score, 35);
        for name in [
            TestName::CredentialCheck,
            TestName::TunnelHandshake,
            TestName::PayloadRoundTrip,
            TestName::LatencySampling,
            TestName::ThroughputSampling,
        ] {
            assert_eq!(report.test(name).unwrap().status, TestStatus::NotRun);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_bridge_scores_excellent() {
        let target = DiagnosticTarget {
            host: "bridge.example".into(),
            port: 443,
            token: "eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.c2ln".into(),
        };
        let report = run_with_probe(
            Arc::new(FakeProbe::default()),
            &target,
            DEFAULT_TEST_TIMEOUT,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(report.health_score, 100);
        assert_eq!(report.status, HealthStatus::Excellent);
    }
}
