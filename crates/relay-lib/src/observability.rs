//! Observability infrastructure for the metrics relay
//!
//! Provides:
//! - Prometheus metrics (watch events, scrape and forward outcomes and latencies)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    Encoder, GaugeVec, Histogram, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for network round trips (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<RelayMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct RelayMetricsInner {
    watch_events: IntCounterVec,
    services_processed: IntCounter,
    scrapes: IntCounterVec,
    scrape_latency_seconds: Histogram,
    points_forwarded: IntCounter,
    forward_errors: IntCounter,
    forward_latency_seconds: Histogram,
    event_failures: IntCounter,
    node_address_info: GaugeVec,
}

impl RelayMetricsInner {
    fn new() -> Self {
        Self {
            watch_events: register_int_counter_vec!(
                "metrics_relay_watch_events_total",
                "Service watch events received, by kind",
                &["kind"]
            )
            .expect("Failed to register watch_events"),

            services_processed: register_int_counter!(
                "metrics_relay_services_processed_total",
                "Services whose ports were all scraped and forwarded"
            )
            .expect("Failed to register services_processed"),

            scrapes: register_int_counter_vec!(
                "metrics_relay_scrapes_total",
                "Scrapes issued, by outcome",
                &["outcome"]
            )
            .expect("Failed to register scrapes"),

            scrape_latency_seconds: register_histogram!(
                "metrics_relay_scrape_latency_seconds",
                "Time spent fetching a target's exposition payload",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scrape_latency_seconds"),

            points_forwarded: register_int_counter!(
                "metrics_relay_points_forwarded_total",
                "Points written to the sink"
            )
            .expect("Failed to register points_forwarded"),

            forward_errors: register_int_counter!(
                "metrics_relay_forward_errors_total",
                "Failed sink writes"
            )
            .expect("Failed to register forward_errors"),

            forward_latency_seconds: register_histogram!(
                "metrics_relay_forward_latency_seconds",
                "Time spent writing one batch to the sink",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register forward_latency_seconds"),

            event_failures: register_int_counter!(
                "metrics_relay_event_failures_total",
                "Watch events whose processing failed"
            )
            .expect("Failed to register event_failures"),

            node_address_info: register_gauge_vec!(
                "metrics_relay_node_address_info",
                "Node address used as the host of every scrape target",
                &["address"]
            )
            .expect("Failed to register node_address_info"),
        }
    }
}

/// Relay metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    _private: (),
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(RelayMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &RelayMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_watch_event(&self, kind: &str) {
        self.inner().watch_events.with_label_values(&[kind]).inc();
    }

    pub fn inc_services_processed(&self) {
        self.inner().services_processed.inc();
    }

    /// Record a scrape outcome and how long it took
    pub fn observe_scrape(&self, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "error" };
        self.inner().scrapes.with_label_values(&[outcome]).inc();
        self.inner().scrape_latency_seconds.observe(duration_secs);
    }

    pub fn observe_forward_latency(&self, duration_secs: f64) {
        self.inner().forward_latency_seconds.observe(duration_secs);
    }

    pub fn add_points_forwarded(&self, points: usize) {
        self.inner().points_forwarded.inc_by(points as u64);
    }

    pub fn inc_forward_errors(&self) {
        self.inner().forward_errors.inc();
    }

    pub fn inc_event_failures(&self) {
        self.inner().event_failures.inc();
    }

    /// Publish the resolved node address
    pub fn set_node_address(&self, address: &str) {
        self.inner().node_address_info.reset();
        self.inner()
            .node_address_info
            .with_label_values(&[address])
            .set(1.0);
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode_text(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Structured logger for relay events
///
/// Provides consistent JSON-formatted logging for the relay's
/// significant lifecycle and pipeline events.
#[derive(Clone)]
pub struct StructuredLogger {
    namespace: String,
}

impl StructuredLogger {
    /// Logger for a relay watching `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Log relay startup
    pub fn log_startup(&self, version: &str, selector: &str, node_address: &str) {
        info!(
            event = "relay_started",
            namespace = %self.namespace,
            relay_version = %version,
            selector = %selector,
            node_address = %node_address,
            "Metrics relay started"
        );
    }

    /// Log relay shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "relay_shutdown",
            namespace = %self.namespace,
            reason = %reason,
            "Metrics relay shutting down"
        );
    }

    /// Log a service admitted for scraping
    pub fn log_service(&self, kind: &str, service: &str, ports: usize) {
        info!(
            event = "service_admitted",
            namespace = %self.namespace,
            kind = %kind,
            service = %service,
            ports = ports,
            "Scraping service"
        );
    }

    /// Log a scrape that reached the sink
    pub fn log_forwarded(&self, service: &str, url: &str, points: usize, database: &str) {
        info!(
            event = "scrape_forwarded",
            namespace = %self.namespace,
            service = %service,
            url = %url,
            points = points,
            database = %database,
            "Forwarded scrape"
        );
    }

    /// Log a failed event that the relay moves past
    pub fn log_event_failure(&self, service: &str, error: &str) {
        warn!(
            event = "event_failed",
            namespace = %self.namespace,
            service = %service,
            error = %error,
            "Event processing failed, continuing"
        );
    }
}
