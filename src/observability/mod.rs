//! Observability
//!
//! Counters, gauges and histograms for the worker, exported as Prometheus text.

pub mod metrics;

pub use metrics::{get_metrics, EvictionCause, MetricsRegistry};
