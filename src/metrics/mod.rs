//! Request/connection metrics, link quality and export formats.
//!
//! - [`collector`]: bounded sample history and windowed aggregates
//! - [`quality`]: rolling latency/loss window mapped to a quality level
//! - [`export`]: Prometheus text, JSON and CSV renderings of a snapshot

pub mod collector;
pub mod export;
pub mod quality;

pub use collector::{MetricsCollector, MetricsSnapshot};
pub use export::{ExportFormat, MetricsExporter};
pub use quality::{ConnectionQualityEstimator, QualityLevel, QualitySample};
