//! Prometheus metrics registry for treesync
//!
//! Provides typed, labeled counters, a throughput gauge and a pass duration
//! histogram. The engine records into it after every pass; nothing reads it
//! back, so it stays a side channel.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use treesync_core::domain::{PassOutcome, ProcessingState, SyncPass};

/// Central metrics registry holding all Prometheus metrics.
pub struct MetricsRegistry {
    registry: Registry,
    /// Counter: finished passes by outcome
    pub passes_total: IntCounterVec,
    /// Counter: executed change descriptors by result (succeeded, failed, not_started)
    pub items_total: IntCounterVec,
    /// Counter: bytes written to target adapters
    pub bytes_transferred_total: IntCounter,
    /// Gauge: most recent transfer throughput
    pub throughput_bytes_per_second: Gauge,
    /// Histogram: wall-clock duration of a pass in seconds
    pub pass_duration_seconds: Histogram,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with all metrics registered.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("treesync".to_string()), None)?;

        let passes_total = IntCounterVec::new(
            Opts::new("passes_total", "Finished synchronization passes"),
            &["outcome"],
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let items_total = IntCounterVec::new(
            Opts::new("items_total", "Executed change descriptors"),
            &["result"],
        )?;
        registry.register(Box::new(items_total.clone()))?;

        let bytes_transferred_total = IntCounter::new(
            "bytes_transferred_total",
            "Total bytes written to target adapters",
        )?;
        registry.register(Box::new(bytes_transferred_total.clone()))?;

        let throughput_bytes_per_second = Gauge::new(
            "throughput_bytes_per_second",
            "Most recent transfer throughput",
        )?;
        registry.register(Box::new(throughput_bytes_per_second.clone()))?;

        let pass_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("pass_duration_seconds", "Pass duration in seconds")
                .buckets(vec![0.1, 1.0, 10.0, 60.0, 600.0, f64::INFINITY]),
        )?;
        registry.register(Box::new(pass_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            passes_total,
            items_total,
            bytes_transferred_total,
            throughput_bytes_per_second,
            pass_duration_seconds,
        })
    }

    // ========================================================================
    // Recording helpers
    // ========================================================================

    /// Record a finished pass: outcome, item results, bytes and duration.
    pub fn record_pass(&self, pass: &SyncPass) {
        let outcome = pass.outcome().unwrap_or(PassOutcome::NotRun);
        self.passes_total
            .with_label_values(&[outcome.name()])
            .inc();
        for descriptor in pass.descriptors() {
            self.record_item(descriptor.state());
        }
        self.bytes_transferred_total.inc_by(pass.bytes_transferred());
        let seconds = pass.duration().num_milliseconds().max(0) as f64 / 1000.0;
        self.pass_duration_seconds.observe(seconds);
    }

    /// Record one executed descriptor.
    pub fn record_item(&self, state: ProcessingState) {
        self.items_total
            .with_label_values(&[&state.to_string()])
            .inc();
    }

    /// Set the throughput gauge.
    pub fn set_throughput(&self, bytes_per_second: f64) {
        self.throughput_bytes_per_second.set(bytes_per_second);
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode all metrics in Prometheus text exposition format.
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
