//! Prometheus metrics for the receive path.
//!
//! Write traffic is labelled by destination: `memory`, `file:<root>` for the
//! temp root a tiered receiver writes under, or `object:<backend>` for direct
//! uploads. The root, not the shard directory, keeps the label set bounded.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};
use std::sync::{Arc, LazyLock, Once};
use std::time::Duration;
use thiserror::Error;

/// Global Prometheus registry for all receive metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RECEIVE_BYTES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_receive_bytes_total",
            "Total bytes written by receivers, by destination",
        ),
        &["destination"],
    )
    .expect("metric creation failed")
});

pub static RECEIVE_WRITE_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "depot_receive_write_seconds",
            "Time spent in a single receiver write, by destination",
        )
        .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["destination"],
    )
    .expect("metric creation failed")
});

pub static TIER_FLUSHES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_receive_tier_flushes_total",
        "Total number of receivers that spilled from memory to a temp file",
    )
    .expect("metric creation failed")
});

pub static FALLBACKS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_receive_fallbacks_total",
            "Fallback requests acted on, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static RECEIVE_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_receive_errors_total",
            "Total failed receives by error kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static RECEIVE_THROUGHPUT: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_receive_throughput_bytes_per_second",
            "Average throughput of completed receives",
        )
        .buckets(prometheus::exponential_buckets(64.0 * 1024.0, 4.0, 10).unwrap_or_default()),
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent: calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(RECEIVE_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RECEIVE_WRITE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TIER_FLUSHES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FALLBACKS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RECEIVE_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RECEIVE_THROUGHPUT.clone()))
            .expect("metric registration failed");
    });
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
}

/// Helper to record failed receives by kind.
pub fn record_error(kind: &str) {
    RECEIVE_ERRORS.with_label_values(&[kind]).inc();
}

/// Helper to record a fallback request outcome.
pub fn record_fallback(outcome: &str) {
    FALLBACKS.with_label_values(&[outcome]).inc();
}

pub fn record_flush() {
    TIER_FLUSHES.inc();
}

pub fn record_throughput(bytes_per_second: f64) {
    RECEIVE_THROUGHPUT.observe(bytes_per_second);
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encode(String),
}

/// Sink for per-write traffic samples of one destination.
pub trait TrafficRecorder: Send + Sync {
    fn record(&self, bytes: u64, elapsed: Duration) -> Result<(), MetricsError>;
}

/// Hands out a [`TrafficRecorder`] per destination.
///
/// Receivers call this again whenever their destination changes, so a
/// recorder always describes where the bytes actually went.
pub trait TrafficMetrics: Send + Sync {
    fn recorder(&self, destination: &str) -> Result<Arc<dyn TrafficRecorder>, MetricsError>;
}

/// [`TrafficMetrics`] backed by the global Prometheus registry.
#[derive(Clone, Copy, Debug)]
pub struct PrometheusTraffic;

impl PrometheusTraffic {
    pub fn new() -> Self {
        register_metrics();
        Self
    }
}

impl Default for PrometheusTraffic {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficMetrics for PrometheusTraffic {
    fn recorder(&self, destination: &str) -> Result<Arc<dyn TrafficRecorder>, MetricsError> {
        Ok(Arc::new(PrometheusRecorder {
            bytes: RECEIVE_BYTES.get_metric_with_label_values(&[destination])?,
            duration: RECEIVE_WRITE_DURATION.get_metric_with_label_values(&[destination])?,
        }))
    }
}

struct PrometheusRecorder {
    bytes: IntCounter,
    duration: Histogram,
}

impl TrafficRecorder for PrometheusRecorder {
    fn record(&self, bytes: u64, elapsed: Duration) -> Result<(), MetricsError> {
        self.bytes.inc_by(bytes);
        self.duration.observe(elapsed.as_secs_f64());
        Ok(())
    }
}

/// Destination label for in-memory buffering.
pub const MEMORY_DESTINATION: &str = "memory";

/// Destination label for a temp root.
pub fn file_destination(root: &std::path::Path) -> String {
    format!("file:{}", root.display())
}

/// Destination label for an object store backend.
pub fn object_destination(backend: &str) -> String {
    format!("object:{backend}")
}
