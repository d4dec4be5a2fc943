//! Stateless renderings of a [`MetricsSnapshot`].

use std::str::FromStr;

use csv::Writer;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use super::collector::{percentile, MetricsSnapshot};

const PREFIX: &str = "tunlink";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("unknown export format '{0}' (expected prometheus, json, json-pretty or csv)")]
    UnknownFormat(String),
    #[error("failed to serialize metrics: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode prometheus metrics: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("failed to write csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to flush csv: {0}")]
    Io(#[from] std::io::Error),
    #[error("exported metrics are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Prometheus,
    Json,
    JsonPretty,
    Csv,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Prometheus => "text/plain; version=0.0.4",
            Self::Json | Self::JsonPretty => "application/json",
            Self::Csv => "text/csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prometheus" | "prometheus-text" | "prom" => Ok(Self::Prometheus),
            "json" => Ok(Self::Json),
            "json-pretty" | "pretty" => Ok(Self::JsonPretty),
            "csv" => Ok(Self::Csv),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PercentileSummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorShare {
    pub error_type: String,
    pub count: u64,
    /// Share of failed requests, 0 to 100.
    pub percentage: f64,
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    requests: JsonRequests,
    latency: JsonLatency,
    errors: Vec<ErrorShare>,
    connection: &'a super::collector::ConnectionStats,
    generated_at: u64,
    window_secs: Option<u64>,
}

#[derive(Serialize)]
struct JsonRequests {
    total: u64,
    successful: u64,
    failed: u64,
    slow: u64,
    success_rate: f64,
    failure_percentage: f64,
}

#[derive(Serialize)]
struct JsonLatency {
    avg_ms: f64,
    min_ms: f64,
    max_ms: f64,
    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
}

pub struct MetricsExporter;

impl MetricsExporter {
    pub fn export(snapshot: &MetricsSnapshot, format: ExportFormat) -> Result<String, ExportError> {
        match format {
            ExportFormat::Prometheus => Self::prometheus(snapshot),
            ExportFormat::Json => Ok(serde_json::to_string(&Self::document(snapshot))?),
            ExportFormat::JsonPretty => Ok(serde_json::to_string_pretty(&Self::document(snapshot))?),
            ExportFormat::Csv => Self::csv(snapshot),
        }
    }

    /// Percentiles recomputed from the snapshot's sorted latencies.
    pub fn percentiles(snapshot: &MetricsSnapshot) -> PercentileSummary {
        let sorted = &snapshot.sorted_latencies;
        PercentileSummary {
            p50: percentile(sorted, 50.0),
            p95: percentile(sorted, 95.0),
            p99: percentile(sorted, 99.0),
            samples: sorted.len(),
        }
    }

    /// Failures per error type, most frequent first.
    pub fn error_breakdown(snapshot: &MetricsSnapshot) -> Vec<ErrorShare> {
        let failed = snapshot.failed_requests;
        let mut shares: Vec<ErrorShare> = snapshot
            .errors_by_type
            .iter()
            .map(|(error_type, &count)| ErrorShare {
                error_type: error_type.clone(),
                count,
                percentage: if failed == 0 {
                    0.0
                } else {
                    count as f64 * 100.0 / failed as f64
                },
            })
            .collect();
        shares.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error_type.cmp(&b.error_type)));
        shares
    }

    fn document(s: &MetricsSnapshot) -> JsonDocument<'_> {
        JsonDocument {
            requests: JsonRequests {
                total: s.total_requests,
                successful: s.successful_requests,
                failed: s.failed_requests,
                slow: s.slow_requests,
                success_rate: s.success_rate,
                failure_percentage: s.failure_percentage,
            },
            latency: JsonLatency {
                avg_ms: s.avg_latency_ms,
                min_ms: s.min_latency_ms,
                max_ms: s.max_latency_ms,
                p50_ms: s.p50_latency_ms,
                p95_ms: s.p95_latency_ms,
                p99_ms: s.p99_latency_ms,
            },
            errors: Self::error_breakdown(s),
            connection: &s.connection,
            generated_at: s.generated_at,
            window_secs: s.window_secs,
        }
    }

    fn prometheus(s: &MetricsSnapshot) -> Result<String, ExportError> {
        let registry = Registry::new_custom(Some(PREFIX.to_string()), None)?;
        let counter = |name: &str, help: &str, value: u64| -> prometheus::Result<()> {
            let c = IntCounter::new(name, help)?;
            c.inc_by(value);
            registry.register(Box::new(c))
        };
        counter("requests_total", "Total requests observed", s.total_requests)?;
        counter(
            "requests_successful_total",
            "Requests that completed successfully",
            s.successful_requests,
        )?;
        counter("requests_failed_total", "Requests that failed", s.failed_requests)?;
        counter(
            "requests_slow_total",
            "Requests at or above the slow threshold",
            s.slow_requests,
        )?;
        counter("connects_total", "Transitions into connected", s.connection.connects)?;
        counter("disconnects_total", "Transitions into disconnected", s.connection.disconnects)?;
        counter(
            "reconnect_attempts_total",
            "Reconnection attempts",
            s.connection.reconnect_attempts,
        )?;
        counter(
            "reconnect_successes_total",
            "Successful reconnection attempts",
            s.connection.reconnect_successes,
        )?;

        let gauge = |name: &str, help: &str, value: f64| -> prometheus::Result<()> {
            let g = Gauge::new(name, help)?;
            g.set(value);
            registry.register(Box::new(g))
        };
        gauge("request_success_rate", "Successful / total requests", s.success_rate)?;
        gauge("request_latency_avg_ms", "Mean request latency", s.avg_latency_ms)?;
        gauge("request_latency_p50_ms", "Median request latency", s.p50_latency_ms)?;
        gauge("request_latency_p95_ms", "95th percentile request latency", s.p95_latency_ms)?;
        gauge("request_latency_p99_ms", "99th percentile request latency", s.p99_latency_ms)?;

        if !s.errors_by_type.is_empty() {
            let errors = IntCounterVec::new(
                Opts::new("errors_total", "Failed requests by error type"),
                &["type"],
            )?;
            for (error_type, count) in &s.errors_by_type {
                errors.with_label_values(&[error_type.as_str()]).inc_by(*count);
            }
            registry.register(Box::new(errors))?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    fn csv(s: &MetricsSnapshot) -> Result<String, ExportError> {
        let rows: [(&str, f64); 15] = [
            ("total_requests", s.total_requests as f64),
            ("successful_requests", s.successful_requests as f64),
            ("failed_requests", s.failed_requests as f64),
            ("slow_requests", s.slow_requests as f64),
            ("success_rate", s.success_rate),
            ("failure_percentage", s.failure_percentage),
            ("avg_latency_ms", s.avg_latency_ms),
            ("min_latency_ms", s.min_latency_ms),
            ("max_latency_ms", s.max_latency_ms),
            ("p50_latency_ms", s.p50_latency_ms),
            ("p95_latency_ms", s.p95_latency_ms),
            ("p99_latency_ms", s.p99_latency_ms),
            ("connects", s.connection.connects as f64),
            ("disconnects", s.connection.disconnects as f64),
            ("reconnect_attempts", s.connection.reconnect_attempts as f64),
        ];

        let mut writer = Writer::from_writer(Vec::new());
        writer.write_record(["metric", "value"])?;
        for (name, value) in rows {
            writer.write_record([name.to_string(), value.to_string()])?;
        }
        for (error_type, count) in &s.errors_by_type {
            writer.write_record([format!("errors.{error_type}"), count.to_string()])?;
        }
        let buffer = writer.into_inner().map_err(|e| e.into_error())?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;

    fn sample() -> MetricsSnapshot {
        let c = MetricsCollector::new(10_000, 100, 1000);
        for i in 1..=200u32 {
            let latency = f64::from(i * 7 % 301);
            match i % 25 {
                0 => c.record_request(latency, false, Some("timeout")),
                13 => c.record_request(latency, false, Some("server")),
                _ => c.record_request(latency, true, None),
            }
        }
        c.get_metrics(None)
    }

    fn nearest_rank(values: &[f64], p: f64) -> f64 {
        let mut v = values.to_vec();
        v.sort_by(f64::total_cmp);
        let mut rank = 1;
        while (rank as f64) * 100.0 < p * v.len() as f64 {
            rank += 1;
        }
        v[rank - 1]
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("prometheus".parse::<ExportFormat>().unwrap(), ExportFormat::Prometheus);
        assert_eq!("prometheus-text".parse::<ExportFormat>().unwrap(), ExportFormat::Prometheus);
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("json-pretty".parse::<ExportFormat>().unwrap(), ExportFormat::JsonPretty);
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!(matches!(
            "xml".parse::<ExportFormat>(),
            Err(ExportError::UnknownFormat(f)) if f == "xml"
        ));
    }

    #[test]
    fn percentiles_match_independent_nearest_rank() {
        let snap = sample();
        let raw: Vec<f64> = (1..=200u32).map(|i| f64::from(i * 7 % 301)).collect();
        let p = MetricsExporter::percentiles(&snap);
        assert_eq!(p.samples, 200);
        assert_eq!(p.p50, nearest_rank(&raw, 50.0));
        assert_eq!(p.p95, nearest_rank(&raw, 95.0));
        assert_eq!(p.p99, nearest_rank(&raw, 99.0));
        assert_eq!(p.p95, snap.p95_latency_ms);
    }

    #[test]
    fn prometheus_has_help_type_and_labels() {
        let text = MetricsExporter::export(&sample(), ExportFormat::Prometheus).unwrap();
        assert!(text.contains("# HELP tunlink_requests_total "));
        assert!(text.contains("# TYPE tunlink_requests_total counter"));
        assert!(text.contains("\ntunlink_requests_total 200\n"));
        assert!(text.contains("tunlink_request_latency_avg_ms "));
        assert!(text.contains("tunlink_request_latency_p95_ms "));
        assert!(text.contains("tunlink_request_latency_p99_ms "));
        assert!(text.contains("tunlink_errors_total{type=\"timeout\"} 8"));
        assert!(text.contains("tunlink_errors_total{type=\"server\"} 8"));
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            assert!(line.starts_with("tunlink_"), "unprefixed line: {line}");
        }
    }

    #[test]
    fn json_is_nested() {
        let json = MetricsExporter::export(&sample(), ExportFormat::Json).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["requests"]["total"], 200);
        assert_eq!(v["requests"]["failed"], 16);
        assert!(v["latency"]["p99_ms"].is_number());
        assert_eq!(v["errors"].as_array().unwrap().len(), 2);

        let pretty = MetricsExporter::export(&sample(), ExportFormat::JsonPretty).unwrap();
        assert!(pretty.contains('\n'));
    }

    #[test]
    fn csv_is_flat() {
        let csv = MetricsExporter::export(&sample(), ExportFormat::Csv).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("metric,value"));
        assert!(csv.contains("\ntotal_requests,200\n"));
        assert!(csv.contains("\nerrors.timeout,8\n"));
        assert!(lines.all(|l| l.split(',').count() == 2));
    }

    #[test]
    fn reserved_characters_in_error_types_stay_in_one_field() {
        let c = MetricsCollector::new(10, 10, 1000);
        c.record_request(5.0, false, Some("x,y\"z\nw"));
        let snap = c.get_metrics(None);

        let body = MetricsExporter::export(&snap, ExportFormat::Csv).unwrap();
        let mut reader = csv::Reader::from_reader(body.as_bytes());
        let errors: Vec<csv::StringRecord> = reader
            .records()
            .map(Result::unwrap)
            .filter(|r| r[0].starts_with("errors."))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(&errors[0][0], "errors.x,y\"z\nw");
        assert_eq!(&errors[0][1], "1");

        let text = MetricsExporter::export(&snap, ExportFormat::Prometheus).unwrap();
        assert!(text.contains(r#"tunlink_errors_total{type="x,y\"z\nw"} 1"#));
    }

    #[test]
    fn error_breakdown_shares_sum_to_hundred() {
        let shares = MetricsExporter::error_breakdown(&sample());
        let total: f64 = shares.iter().map(|s| s.percentage).sum();
        assert!((total - 100.0).abs() < 1e-9);
        assert_eq!(shares[0].error_type, "server");
    }

    #[test]
    fn empty_snapshot_exports() {
        let snap = MetricsCollector::new(10, 10, 1000).get_metrics(None);
        let text = MetricsExporter::export(&snap, ExportFormat::Prometheus).unwrap();
        assert!(!text.contains("tunlink_errors_total"));
        assert!(MetricsExporter::error_breakdown(&snap).is_empty());
        assert_eq!(MetricsExporter::percentiles(&snap).samples, 0);
    }
}
