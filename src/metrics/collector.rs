//! Bounded metrics history.
//!
//! Request samples live in a `VecDeque` capped at `max_history` and evicted
//! oldest-first; connection and reconnection samples share a smaller cap.
//! Appends take a `std::sync::Mutex` for the duration of a `push_back`, so
//! they are safe to call from any number of concurrently completing requests
//! and never await.
//!
//! Percentiles use the nearest-rank method on a sorted copy of the latencies
//! in the window: `rank = ceil(p / 100 * n)`, value = `sorted[rank - 1]`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::state::ConnectionState;
use crate::util::now_ms;

/// One completed request.
#[derive(Debug, Clone, Serialize)]
pub struct MetricDataPoint {
    pub timestamp: u64,
    pub latency_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionSample {
    timestamp: u64,
    state: ConnectionState,
    reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ReconnectionSample {
    timestamp: u64,
    attempt_number: u32,
    success: bool,
    delay_ms: Option<u64>,
}

/// Connection lifecycle counters within a window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub connects: u64,
    pub disconnects: u64,
    pub errors: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub avg_reconnect_delay_ms: f64,
    pub last_disconnect_reason: Option<String>,
}

/// Aggregates over the requested window.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: u64,
    /// Window length in seconds; `None` means all retained history.
    pub window_secs: Option<u64>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Successful / total, in `[0, 1]`.
    pub success_rate: f64,
    /// Failed / total, as a percentage.
    pub failure_percentage: f64,
    pub slow_requests: u64,
    pub slow_request_threshold_ms: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    /// Failed request count per `error_type` (`"unknown"` when absent).
    pub errors_by_type: BTreeMap<String, u64>,
    pub connection: ConnectionStats,
    /// Latencies in the window, sorted ascending. Not serialized.
    #[serde(skip)]
    pub sorted_latencies: Vec<f64>,
}

impl MetricsSnapshot {
    /// Failure percentage formatted with two decimals, e.g. `"5.00"`.
    pub fn failure_percentage_str(&self) -> String {
        format!("{:.2}", self.failure_percentage)
    }
}

/// Nearest-rank percentile over an ascending slice. Empty input yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let rank = (p * n as f64 / 100.0).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

struct History {
    requests: VecDeque<MetricDataPoint>,
    connections: VecDeque<ConnectionSample>,
    reconnections: VecDeque<ReconnectionSample>,
}

pub struct MetricsCollector {
    history: Mutex<History>,
    max_history: usize,
    max_event_history: usize,
    slow_request_ms: u64,
}

impl MetricsCollector {
    pub fn new(max_history: usize, max_event_history: usize, slow_request_ms: u64) -> Self {
        Self {
            history: Mutex::new(History {
                requests: VecDeque::with_capacity(max_history.min(16_384)),
                connections: VecDeque::new(),
                reconnections: VecDeque::new(),
            }),
            max_history: max_history.max(1),
            max_event_history: max_event_history.max(1),
            slow_request_ms,
        }
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_bounded<T>(buf: &mut VecDeque<T>, cap: usize, item: T) {
        while buf.len() >= cap {
            buf.pop_front();
        }
        buf.push_back(item);
    }

    /// Record one completed request.
    pub fn record_request(&self, latency_ms: f64, success: bool, error_type: Option<&str>) {
        self.push_request(MetricDataPoint {
            timestamp: now_ms(),
            latency_ms,
            success,
            error_type: error_type.map(ToString::to_string),
        });
    }

    fn push_request(&self, point: MetricDataPoint) {
        let cap = self.max_history;
        Self::push_bounded(&mut self.history().requests, cap, point);
    }

    /// Record a connection state change.
    pub fn record_connection(&self, state: ConnectionState, reason: Option<&str>) {
        let cap = self.max_event_history;
        Self::push_bounded(
            &mut self.history().connections,
            cap,
            ConnectionSample {
                timestamp: now_ms(),
                state,
                reason: reason.map(ToString::to_string),
            },
        );
    }

    /// Record the outcome of one reconnection attempt.
    pub fn record_reconnection(&self, attempt_number: u32, success: bool, delay: Option<Duration>) {
        let cap = self.max_event_history;
        Self::push_bounded(
            &mut self.history().reconnections,
            cap,
            ReconnectionSample {
                timestamp: now_ms(),
                attempt_number,
                success,
                delay_ms: delay.map(|d| d.as_millis() as u64),
            },
        );
    }

    /// Number of retained request samples.
    pub fn len(&self) -> usize {
        self.history().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Retained request samples, oldest first.
    pub fn data_points(&self) -> Vec<MetricDataPoint> {
        self.history().requests.iter().cloned().collect()
    }

    /// Aggregates over the last `window`, or all retained history.
    pub fn get_metrics(&self, window: Option<Duration>) -> MetricsSnapshot {
        self.metrics_at(now_ms(), window)
    }

    fn metrics_at(&self, now: u64, window: Option<Duration>) -> MetricsSnapshot {
        let cutoff = window.map_or(0, |w| now.saturating_sub(w.as_millis() as u64));
        let history = self.history();

        let mut total = 0u64;
        let mut successful = 0u64;
        let mut slow = 0u64;
        let mut errors_by_type = BTreeMap::new();
        let mut latencies = Vec::new();

        for point in history.requests.iter().filter(|p| p.timestamp >= cutoff) {
            total += 1;
            latencies.push(point.latency_ms);
            if point.success {
                successful += 1;
            } else {
                let key = point.error_type.clone().unwrap_or_else(|| "unknown".to_string());
                *errors_by_type.entry(key).or_insert(0u64) += 1;
            }
            if point.latency_ms >= self.slow_request_ms as f64 {
                slow += 1;
            }
        }

        let mut connection = ConnectionStats::default();
        for sample in history.connections.iter().filter(|s| s.timestamp >= cutoff) {
            match sample.state {
                ConnectionState::Connected => connection.connects += 1,
                ConnectionState::Disconnected => {
                    connection.disconnects += 1;
                    connection.last_disconnect_reason.clone_from(&sample.reason);
                }
                ConnectionState::Error => connection.errors += 1,
                _ => {}
            }
        }
        let mut delay_sum = 0u64;
        let mut delay_count = 0u64;
        for sample in history.reconnections.iter().filter(|s| s.timestamp >= cutoff) {
            connection.reconnect_attempts += 1;
            if sample.success {
                connection.reconnect_successes += 1;
            }
            if let Some(d) = sample.delay_ms {
                delay_sum += d;
                delay_count += 1;
            }
        }
        drop(history);

        if delay_count > 0 {
            connection.avg_reconnect_delay_ms = delay_sum as f64 / delay_count as f64;
        }

        latencies.sort_by(f64::total_cmp);
        let failed = total - successful;
        let (success_rate, failure_percentage, avg) = if total == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (
                successful as f64 / total as f64,
                failed as f64 * 100.0 / total as f64,
                latencies.iter().sum::<f64>() / total as f64,
            )
        };

        MetricsSnapshot {
            generated_at: now,
            window_secs: window.map(|w| w.as_secs()),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            success_rate,
            failure_percentage,
            slow_requests: slow,
            slow_request_threshold_ms: self.slow_request_ms,
            avg_latency_ms: avg,
            min_latency_ms: latencies.first().copied().unwrap_or(0.0),
            max_latency_ms: latencies.last().copied().unwrap_or(0.0),
            p50_latency_ms: percentile(&latencies, 50.0),
            p95_latency_ms: percentile(&latencies, 95.0),
            p99_latency_ms: percentile(&latencies, 99.0),
            errors_by_type,
            connection,
            sorted_latencies: latencies,
        }
    }
}
