//! treesync Telemetry - pass metrics
//!
//! Provides:
//! - `MetricsRegistry`: Prometheus counters, gauge and histogram describing
//!   synchronization passes, exposed in text format by `gather_text()`

pub mod metrics;

pub use metrics::MetricsRegistry;
