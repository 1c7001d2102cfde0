//! # mcp-telemetry
//!
//! Runtime telemetry engine for MCP applications.
//!
//! This crate ingests scalar performance samples (timings, memory readings,
//! counters) emitted by instrumented application code and provides real-time
//! windowed aggregation, z-score anomaly detection, threshold alerting with
//! sustained-violation semantics, and least-squares trend estimation.
//!
//! The engine is an in-process library: it emits typed events onto a
//! broadcast bus and returns plain structured data, leaving delivery and
//! persistence to collaborating components.

pub mod aggregator;
pub mod anomaly;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod threshold;
pub mod trend;

pub use aggregator::{AggregationConfig, AggregationKind, SlidingWindowAggregator};
pub use anomaly::{AnomalyDetector, AnomalyOutcome};
pub use engine::{MetricsEngine, MetricReport, TelemetryReport};
pub use error::{Result, TelemetryError};
pub use events::TelemetryEvent;
pub use metrics::{Metric, MetricKind, MetricStatistics, Sample};
pub use threshold::{
    ThresholdConfig, ThresholdTracker, ThresholdViolation, ViolationCallback, ViolationLevel,
};
pub use trend::{TrendCalculator, TrendDirection, TrendInfo};
