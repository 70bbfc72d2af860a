//! Prometheus metrics for the ingestion service.
//!
//! ## Metrics
//!
//! **Counters:**
//! - `sparcus_updates_total`: writes by kind (numeric/text)
//! - `sparcus_reads_total`: reads by kind (latest/average) and status
//! - `sparcus_dispatches_total`: handler runs by outcome
//! - `sparcus_forward_errors_total`: forwarding failures by sink
//! - `sparcus_forward_dropped_total`: updates dropped on a full sink queue, by sink
//!
//! **Gauges:**
//! - `sparcus_keys`: keys in the store
//! - `sparcus_events`: events in the log
//! - `sparcus_uptime_seconds`
//!
//! **Histograms:**
//! - `sparcus_handler_duration_seconds`
//!
//! **Info:**
//! - `sparcus_build_info`: version

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Prometheus metrics collection.
///
/// Cloning shares the underlying metrics.
#[derive(Clone)]
pub struct SparcusMetrics {
    pub registry: Registry,

    // Counters
    pub updates_total: IntCounterVec,
    pub reads_total: IntCounterVec,
    pub dispatches_total: IntCounterVec,
    pub forward_errors_total: IntCounterVec,
    pub forward_dropped_total: IntCounterVec,

    // Gauges
    pub keys: IntGauge,
    pub events: IntGauge,
    pub uptime_seconds: IntGauge,

    // Histograms
    pub handler_duration_seconds: Histogram,

    started_at: Instant,
}

impl SparcusMetrics {
    /// Create a new metrics collection and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // -- Counters --
        let updates_total = IntCounterVec::new(
            Opts::new("sparcus_updates_total", "Readings written by value kind"),
            &["kind"],
        )?;
        registry.register(Box::new(updates_total.clone()))?;

        let reads_total = IntCounterVec::new(
            Opts::new("sparcus_reads_total", "Readings read by kind and status"),
            &["kind", "status"],
        )?;
        registry.register(Box::new(reads_total.clone()))?;

        let dispatches_total = IntCounterVec::new(
            Opts::new("sparcus_dispatches_total", "Handler executions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(dispatches_total.clone()))?;

        let forward_errors_total = IntCounterVec::new(
            Opts::new("sparcus_forward_errors_total", "Forwarding failures by sink"),
            &["sink"],
        )?;
        registry.register(Box::new(forward_errors_total.clone()))?;

        let forward_dropped_total = IntCounterVec::new(
            Opts::new(
                "sparcus_forward_dropped_total",
                "Updates dropped because a sink queue was full",
            ),
            &["sink"],
        )?;
        registry.register(Box::new(forward_dropped_total.clone()))?;

        // -- Gauges --
        let keys = IntGauge::new("sparcus_keys", "Keys held in the store")?;
        registry.register(Box::new(keys.clone()))?;

        let events = IntGauge::new("sparcus_events", "Events held in the event log")?;
        registry.register(Box::new(events.clone()))?;

        let uptime_seconds = IntGauge::new("sparcus_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        // -- Histograms --
        let handler_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sparcus_handler_duration_seconds",
                "Handler execution duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(handler_duration_seconds.clone()))?;

        // -- Info --
        let build_info = IntGauge::with_opts(
            Opts::new("sparcus_build_info", "Build information")
                .const_label("version", env!("CARGO_PKG_VERSION")),
        )?;
        build_info.set(1);
        registry.register(Box::new(build_info))?;

        Ok(Self {
            registry,
            updates_total,
            reads_total,
            dispatches_total,
            forward_errors_total,
            forward_dropped_total,
            keys,
            events,
            uptime_seconds,
            handler_duration_seconds,
            started_at: Instant::now(),
        })
    }

    pub fn record_update(&self, kind: &str) {
        self.updates_total.with_label_values(&[kind]).inc();
    }

    pub fn record_read(&self, kind: &str, status: &str) {
        self.reads_total.with_label_values(&[kind, status]).inc();
    }

    /// Record a finished handler run.
    pub fn record_dispatch(&self, outcome: &str, duration_secs: f64) {
        self.dispatches_total.with_label_values(&[outcome]).inc();
        self.handler_duration_seconds.observe(duration_secs);
    }

    pub fn record_forward_error(&self, sink: &str) {
        self.forward_errors_total.with_label_values(&[sink]).inc();
    }

    pub fn record_forward_dropped(&self, sink: &str) {
        self.forward_dropped_total.with_label_values(&[sink]).inc();
    }

    /// Refresh the store and event log size gauges.
    pub fn set_sizes(&self, keys: usize, events: usize) {
        self.keys.set(keys as i64);
        self.events.set(events as i64);
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);

        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for SparcusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparcusMetrics")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
