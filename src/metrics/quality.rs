//! Link quality from a rolling window of liveness samples.
//!
//! | Level     | Avg latency | Loss  |
//! |-----------|-------------|-------|
//! | excellent | < 50 ms     | < 1 % |
//! | good      | < 100 ms    | < 3 % |
//! | fair      | < 200 ms    | < 5 % |
//! | poor      | otherwise   |       |
//!
//! Average latency is taken over answered samples; loss is missed / total.
//! A level change (and only a change) is published on a broadcast channel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::util::duration_ms;

const QUALITY_CHANNEL_CAPACITY: usize = 32;

/// One liveness measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualitySample {
    pub latency_ms: f64,
    pub success: bool,
}

impl QualitySample {
    pub fn answered(rtt: Duration) -> Self {
        Self {
            latency_ms: duration_ms(rtt),
            success: true,
        }
    }

    pub fn missed() -> Self {
        Self {
            latency_ms: 0.0,
            success: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        }
    }

    /// Classify an average latency and loss percentage.
    pub fn classify(avg_latency_ms: f64, loss_pct: f64) -> Self {
        if avg_latency_ms < 50.0 && loss_pct < 1.0 {
            Self::Excellent
        } else if avg_latency_ms < 100.0 && loss_pct < 3.0 {
            Self::Good
        } else if avg_latency_ms < 200.0 && loss_pct < 5.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published when the level changes.
#[derive(Debug, Clone, Serialize)]
pub struct QualityChange {
    pub previous: Option<QualityLevel>,
    pub current: QualityLevel,
    pub score: u8,
    pub avg_latency_ms: f64,
    pub loss_pct: f64,
}

/// Result of the latest recompute.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityReport {
    pub level: Option<QualityLevel>,
    pub score: u8,
    pub avg_latency_ms: f64,
    pub loss_pct: f64,
    pub samples: usize,
}

/// 0 to 100 score: half from latency (0 at 500 ms), half from loss (0 at 10 %).
pub fn quality_score(avg_latency_ms: f64, loss_pct: f64) -> u8 {
    let latency = (100.0 - avg_latency_ms / 5.0).clamp(0.0, 100.0);
    let loss = (100.0 - loss_pct * 10.0).clamp(0.0, 100.0);
    #[allow(clippy::cast_sign_loss)]
    let score = (0.5 * latency + 0.5 * loss).round() as u8;
    score
}

struct Window {
    samples: VecDeque<QualitySample>,
    report: QualityReport,
}

pub struct ConnectionQualityEstimator {
    window: Mutex<Window>,
    capacity: usize,
    changes: broadcast::Sender<QualityChange>,
}

impl ConnectionQualityEstimator {
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(QUALITY_CHANNEL_CAPACITY);
        Self {
            window: Mutex::new(Window {
                samples: VecDeque::with_capacity(capacity),
                report: QualityReport {
                    level: None,
                    score: 0,
                    avg_latency_ms: 0.0,
                    loss_pct: 0.0,
                    samples: 0,
                },
            }),
            capacity: capacity.max(1),
            changes,
        }
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QualityChange> {
        self.changes.subscribe()
    }

    /// Add a sample to the rolling window. Does not recompute.
    pub fn record(&self, sample: QualitySample) {
        let mut w = self.window();
        while w.samples.len() >= self.capacity {
            w.samples.pop_front();
        }
        w.samples.push_back(sample);
    }

    /// Recompute from the current window; publishes if the level changed.
    pub fn recompute(&self) -> QualityReport {
        let (report, change) = {
            let mut w = self.window();
            let total = w.samples.len();
            if total == 0 {
                return w.report;
            }
            let (sum, answered) = w
                .samples
                .iter()
                .filter(|s| s.success)
                .fold((0.0, 0usize), |(sum, n), s| (sum + s.latency_ms, n + 1));
            let missed = total - answered;
            let avg = if answered == 0 {
                0.0
            } else {
                sum / answered as f64
            };
            let loss_pct = missed as f64 * 100.0 / total as f64;
            let level = QualityLevel::classify(avg, loss_pct);
            let previous = w.report.level;
            w.report = QualityReport {
                level: Some(level),
                score: quality_score(avg, loss_pct),
                avg_latency_ms: avg,
                loss_pct,
                samples: total,
            };
            let change = (previous != Some(level)).then(|| QualityChange {
                previous,
                current: level,
                score: w.report.score,
                avg_latency_ms: avg,
                loss_pct,
            });
            (w.report, change)
        };

        if let Some(change) = change {
            info!(
                from = change.previous.map_or("none", QualityLevel::as_str),
                to = change.current.as_str(),
                score = change.score,
                "Connection quality changed"
            );
            let _ = self.changes.send(change);
        }
        report
    }

    /// Latest computed report (no recompute).
    pub fn report(&self) -> QualityReport {
        self.window().report
    }

    pub fn level(&self) -> Option<QualityLevel> {
        self.report().level
    }

    pub fn quality_score(&self) -> u8 {
        self.report().score
    }

    /// Recompute every `every` until cancelled.
    pub fn spawn(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let estimator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => { estimator.recompute(); }
                }
            }
        })
    }
}
