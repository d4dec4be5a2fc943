//! Health scoring and rendering of a diagnostic run.
//!
//! Score: `round(60 * passed / executed)` (0 when nothing executed) plus a
//! fixed bonus per passed test, clamped to `[0, 100]`:
//!
//! | Test                   | Bonus              |
//! |------------------------|--------------------|
//! | name resolution        | 5                  |
//! | transport connectivity | 10                 |
//! | credential check       | 5                  |
//! | tunnel handshake       | 10                 |
//! | latency sampling       | 5, +3 if < 50 ms   |
//! | throughput sampling    | 5, +2 if > 500 KiB/s |

use std::fmt::Write as _;
use std::str::FromStr;

use serde::Serialize;
use uuid::Uuid;

use super::runner::{keys, DiagnosticTarget, TestName, TestResult, TestStatus};
use super::runner::{LATENCY_PASS_MS, THROUGHPUT_PASS_KIB_S};
use crate::util::now_ms;

const FAST_LATENCY_MS: f64 = 50.0;
const HIGH_LATENCY_MS: f64 = 100.0;
const FAST_THROUGHPUT_KIB_S: f64 = 500.0;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unknown report format '{0}' (expected text, json or markdown)")]
    UnknownFormat(String),
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to render report: {0}")]
    Fmt(#[from] std::fmt::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
    Markdown,
}

impl FromStr for ReportFormat {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(RenderError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl HealthStatus {
    pub fn from_score(score: u8) -> Self {
        match score {
            90.. => Self::Excellent,
            75..=89 => Self::Good,
            50..=74 => Self::Fair,
            25..=49 => Self::Poor,
            _ => Self::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub id: Uuid,
    pub generated_at: u64,
    pub host: String,
    pub port: u16,
    pub duration_ms: f64,
    pub health_score: u8,
    pub status: HealthStatus,
    pub passed: usize,
    pub failed: usize,
    pub not_run: usize,
    pub tests: Vec<TestResult>,
    pub recommendations: Vec<String>,
}

impl DiagnosticReport {
    pub fn test(&self, name: TestName) -> Option<&TestResult> {
        self.tests.iter().find(|t| t.name == name)
    }

    pub fn render(&self, format: ReportFormat) -> Result<String, RenderError> {
        match format {
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Text => self.render_text(),
            ReportFormat::Markdown => self.render_markdown(),
        }
    }

    fn render_text(&self) -> Result<String, RenderError> {
        let mut out = String::new();
        writeln!(out, "Connection diagnostics for {}:{}", self.host, self.port)?;
        writeln!(
            out,
            "Health: {}/100 ({}), {} passed, {} failed, {} not run",
            self.health_score,
            self.status.as_str(),
            self.passed,
            self.failed,
            self.not_run
        )?;
        writeln!(out)?;
        for t in &self.tests {
            let mark = match t.status {
                TestStatus::Passed => "PASS",
                TestStatus::Failed => "FAIL",
                TestStatus::NotRun => "SKIP",
            };
            writeln!(out, "  [{mark}] {:<24} {}", t.name.label(), t.message)?;
        }
        if !self.recommendations.is_empty() {
            writeln!(out)?;
            writeln!(out, "Recommendations:")?;
            for r in &self.recommendations {
                writeln!(out, "  - {r}")?;
            }
        }
        Ok(out)
    }

    fn render_markdown(&self) -> Result<String, RenderError> {
        let mut out = String::new();
        writeln!(out, "# Connection diagnostics: `{}:{}`", self.host, self.port)?;
        writeln!(out)?;
        writeln!(
            out,
            "**Health score:** {}/100 ({})",
            self.health_score,
            self.status.as_str()
        )?;
        writeln!(out)?;
        writeln!(out, "| Test | Status | Duration | Details |")?;
        writeln!(out, "|---|---|---|---|")?;
        for t in &self.tests {
            writeln!(
                out,
                "| {} | {} | {:.0} ms | {} |",
                t.name.label(),
                t.status.as_str(),
                t.duration_ms,
                t.message.replace('|', "\\|")
            )?;
        }
        if !self.recommendations.is_empty() {
            writeln!(out)?;
            writeln!(out, "## Recommendations")?;
            writeln!(out)?;
            for r in &self.recommendations {
                writeln!(out, "- {r}")?;
            }
        }
        Ok(out)
    }
}

fn bonus(result: &TestResult) -> u32 {
    if !result.passed() {
        return 0;
    }
    match result.name {
        TestName::NameResolution | TestName::CredentialCheck => 5,
        TestName::TransportConnectivity | TestName::TunnelHandshake => 10,
        TestName::LatencySampling => {
            let fast = result
                .metric(keys::AVG_MS)
                .is_some_and(|avg| avg < FAST_LATENCY_MS);
            if fast {
                8
            } else {
                5
            }
        }
        TestName::ThroughputSampling => {
            let fast = result
                .metric(keys::KIB_PER_SEC)
                .is_some_and(|rate| rate > FAST_THROUGHPUT_KIB_S);
            if fast {
                7
            } else {
                5
            }
        }
        TestName::PayloadRoundTrip => 0,
    }
}

/// 0 to 100 health score. Only executed tests count toward the pass rate.
pub fn health_score(results: &[TestResult]) -> u8 {
    let passed = results.iter().filter(|r| r.passed()).count();
    let executed = results
        .iter()
        .filter(|r| r.status != TestStatus::NotRun)
        .count();
    let base = if executed == 0 {
        0
    } else {
        (60.0 * passed as f64 / executed as f64).round() as u32
    };
    let total = base + results.iter().map(bonus).sum::<u32>();
    total.min(100) as u8
}

pub struct DiagnosticReportGenerator;

impl DiagnosticReportGenerator {
    pub fn generate(target: &DiagnosticTarget, tests: Vec<TestResult>, duration_ms: f64) -> DiagnosticReport {
        let count = |status| tests.iter().filter(|t| t.status == status).count();
        let (passed, failed, not_run) = (
            count(TestStatus::Passed),
            count(TestStatus::Failed),
            count(TestStatus::NotRun),
        );
        let health_score = health_score(&tests);
        let recommendations = recommendations(target, &tests);
        DiagnosticReport {
            id: Uuid::new_v4(),
            generated_at: now_ms(),
            host: target.host.clone(),
            port: target.port,
            duration_ms,
            health_score,
            status: HealthStatus::from_score(health_score),
            passed,
            failed,
            not_run,
            tests,
            recommendations,
        }
    }
}

fn recommendations(target: &DiagnosticTarget, tests: &[TestResult]) -> Vec<String> {
    let mut out = Vec::new();
    let host = &target.host;
    let port = target.port;

    for t in tests.iter().filter(|t| t.status == TestStatus::Failed) {
        let code = t.error_code.as_deref().unwrap_or("");
        let rec = match t.name {
            TestName::NameResolution => format!(
                "{host} could not be resolved. Check DNS settings, or use the bridge's IP address."
            ),
            TestName::TransportConnectivity if code == "NET_TIMEOUT" => format!(
                "Connecting to {host}:{port} timed out. A firewall may be silently dropping outbound traffic on port {port}."
            ),
            TestName::TransportConnectivity => format!(
                "No TCP connection to {host}:{port}. Check that the bridge is running and port {port} is open."
            ),
            TestName::CredentialCheck => format!(
                "{} Copy the token again from your account settings.",
                t.message
            ),
            TestName::TunnelHandshake if code.starts_with("AUTH_") => {
                "The bridge rejected the token during the handshake. Sign in again to get a fresh token.".to_string()
            }
            TestName::TunnelHandshake => format!(
                "The tunnel upgrade to {host}:{port} failed. Check that any proxy in between supports WebSockets."
            ),
            TestName::PayloadRoundTrip => {
                "Echoed data did not match what was sent. A proxy or antivirus may be rewriting traffic.".to_string()
            }
            TestName::LatencySampling => match t.metric(keys::AVG_MS) {
                Some(avg) => format!(
                    "Average latency is {avg:.0} ms (limit {LATENCY_PASS_MS:.0} ms). Try a wired connection or a closer bridge region."
                ),
                None => "Latency could not be measured; the link dropped during sampling.".to_string(),
            },
            TestName::ThroughputSampling => match t.metric(keys::KIB_PER_SEC) {
                Some(rate) => format!(
                    "Throughput is {rate:.0} KiB/s (minimum {THROUGHPUT_PASS_KIB_S:.0} KiB/s). Large transfers will be slow on this network."
                ),
                None => "Throughput could not be measured; the link dropped during sampling.".to_string(),
            },
        };
        out.push(rec);
    }

    if let Some(latency) = tests
        .iter()
        .find(|t| t.name == TestName::LatencySampling && t.passed())
    {
        if let Some(avg) = latency.metric(keys::AVG_MS).filter(|avg| *avg >= HIGH_LATENCY_MS) {
            out.push(format!(
                "Latency passed but is high ({avg:.0} ms). Interactive sessions may feel sluggish."
            ));
        }
    }

    let skipped = tests.iter().filter(|t| t.status == TestStatus::NotRun).count();
    if skipped > 0 {
        let blocker = tests
            .iter()
            .find(|t| t.status == TestStatus::Failed && t.critical);
        out.push(match blocker {
            Some(b) => format!(
                "{skipped} test(s) were skipped after {} failed. Fix that first, then run diagnostics again.",
                b.name.label().to_lowercase()
            ),
            None => format!("{skipped} test(s) did not run. Run diagnostics again for a complete report."),
        });
    }

    if out.is_empty() {
        out.push("No problems found.".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn target() -> DiagnosticTarget {
        DiagnosticTarget {
            host: "bridge.example".to_string(),
            port: 443,
            token: "opaque-token-0123456789".to_string(),
        }
    }

    fn result(name: TestName, status: TestStatus) -> TestResult {
        let mut metrics = BTreeMap::new();
        match name {
            TestName::LatencySampling => {
                metrics.insert(keys::AVG_MS.to_string(), 30.0);
            }
            TestName::ThroughputSampling => {
                metrics.insert(keys::KIB_PER_SEC.to_string(), 800.0);
            }
            _ => {}
        }
        TestResult {
            name,
            status,
            critical: name.is_critical(),
            duration_ms: 1.0,
            message: status.as_str().to_string(),
            error_code: None,
            metrics,
        }
    }

    fn results(statuses: [TestStatus; 7]) -> Vec<TestResult> {
        TestName::ALL
            .iter()
            .zip(statuses)
            .map(|(&n, s)| result(n, s))
            .collect()
    }

    const P: TestStatus = TestStatus::Passed;
    const F: TestStatus = TestStatus::Failed;
    const N: TestStatus = TestStatus::NotRun;

    #[test]
    fn all_passing_caps_at_hundred() {
        assert_eq!(health_score(&results([P; 7])), 100);
    }

    #[test]
    fn nothing_executed_scores_zero() {
        assert_eq!(health_score(&results([N; 7])), 0);
        assert_eq!(HealthStatus::from_score(0), HealthStatus::Critical);
    }

    #[test]
    fn transport_failure_scores_executed_tests_only() {
        // 1 of 2 executed -> 30, + 5 for name resolution
        let r = results([P, F, N, N, N, N, N]);
        assert_eq!(health_score(&r), 35);
        let report = DiagnosticReportGenerator::generate(&target(), r, 12.0);
        assert_eq!(report.status, HealthStatus::Poor);
        assert_eq!(report.not_run, 5);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("5 test(s) were skipped after transport connectivity failed")));
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(HealthStatus::from_score(90), HealthStatus::Excellent);
        assert_eq!(HealthStatus::from_score(89), HealthStatus::Good);
        assert_eq!(HealthStatus::from_score(75), HealthStatus::Good);
        assert_eq!(HealthStatus::from_score(74), HealthStatus::Fair);
        assert_eq!(HealthStatus::from_score(50), HealthStatus::Fair);
        assert_eq!(HealthStatus::from_score(49), HealthStatus::Poor);
        assert_eq!(HealthStatus::from_score(25), HealthStatus::Poor);
        assert_eq!(HealthStatus::from_score(24), HealthStatus::Critical);
    }

    #[test]
    fn passing_one_more_test_never_lowers_the_score() {
        let options = [P, F, N];
        for mut code in 0..3usize.pow(7) {
            let mut statuses = [P; 7];
            for s in &mut statuses {
                *s = options[code % 3];
                code /= 3;
            }
            let before = health_score(&results(statuses));
            for i in 0..7 {
                if statuses[i] == P {
                    continue;
                }
                let mut better = statuses;
                better[i] = P;
                let after = health_score(&results(better));
                assert!(
                    after >= before,
                    "{statuses:?} -> {better:?}: {before} > {after}"
                );
            }
        }
    }

    #[test]
    fn recommendations_are_specific() {
        let mut r = results([P, P, P, P, P, F, P]);
        r[5].metrics.insert(keys::AVG_MS.to_string(), 340.0);
        let report = DiagnosticReportGenerator::generate(&target(), r, 1.0);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].contains("340 ms"));

        let clean = DiagnosticReportGenerator::generate(&target(), results([P; 7]), 1.0);
        assert_eq!(clean.recommendations, vec!["No problems found.".to_string()]);
    }

    #[test]
    fn high_but_passing_latency_is_flagged() {
        let mut r = results([P; 7]);
        r[5].metrics.insert(keys::AVG_MS.to_string(), 150.0);
        let report = DiagnosticReportGenerator::generate(&target(), r, 1.0);
        assert!(report.recommendations[0].contains("high (150 ms)"));
    }

    #[test]
    fn renders_all_formats() {
        let report = DiagnosticReportGenerator::generate(&target(), results([P, F, N, N, N, N, N]), 5.0);
        let text = report.render(ReportFormat::Text).unwrap();
        assert!(text.contains("Health: 35/100 (poor)"));
        assert!(text.contains("[FAIL] Transport connectivity"));
        let md = report.render("markdown".parse().unwrap()).unwrap();
        assert!(md.contains("| Transport connectivity | failed |"));
        assert!(md.contains("## Recommendations"));
        let json: serde_json::Value =
            serde_json::from_str(&report.render(ReportFormat::Json).unwrap()).unwrap();
        assert_eq!(json["health_score"], 35);
        assert_eq!(json["tests"][2]["status"], "not_run");
        assert!("yaml".parse::<ReportFormat>().is_err());
    }
}
