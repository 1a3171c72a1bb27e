//! Prometheus metrics for the relay core
//!
//! The embedding server exposes [`Metrics::gather`] on its own endpoint.

use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Transport metrics
    /// Current open sockets by role (client/backend)
    pub connections_active: IntGaugeVec,
    /// Times a socket stopped absorbing writes
    pub write_blocked_total: IntCounter,

    // Result metrics
    /// Backend packets relayed to a client
    pub packets_forwarded_total: IntCounter,
    /// Backend packets discarded because the replica was behind
    pub packets_dropped_stale_total: IntCounter,
    /// EOF compatibility rewrites by kind (inject/drop/convert/metadata)
    pub eof_rewrites_total: IntCounterVec,

    // Retry metrics
    /// Replays scheduled by reason (stale/abort)
    pub retries_total: IntCounterVec,
    /// Errors synthesized for the client instead of a replay
    pub abort_errors_total: IntCounter,
    /// Client sockets torn down after a partial result
    pub client_teardowns_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_active = IntGaugeVec::new(
            Opts::new(
                "athena_relay_connections_active",
                "Current number of open sockets",
            ),
            &["role"],
        )
        .expect("valid metric definition");

        let write_blocked_total = IntCounter::new(
            "athena_relay_write_blocked_total",
            "Total number of times a socket write was blocked",
        )
        .expect("valid metric definition");

        let packets_forwarded_total = IntCounter::new(
            "athena_relay_packets_forwarded_total",
            "Total number of backend packets forwarded to clients",
        )
        .expect("valid metric definition");

        let packets_dropped_stale_total = IntCounter::new(
            "athena_relay_packets_dropped_stale_total",
            "Total number of backend packets dropped because the backend was stale",
        )
        .expect("valid metric definition");

        let eof_rewrites_total = IntCounterVec::new(
            Opts::new(
                "athena_relay_eof_rewrites_total",
                "Total number of EOF compatibility rewrites",
            ),
            &["kind"], // inject, drop, convert, metadata
        )
        .expect("valid metric definition");

        let retries_total = IntCounterVec::new(
            Opts::new(
                "athena_relay_retries_total",
                "Total number of transparent request replays scheduled",
            ),
            &["reason"],
        )
        .expect("valid metric definition");

        let abort_errors_total = IntCounter::new(
            "athena_relay_abort_errors_total",
            "Total number of synthesized abort errors sent to clients",
        )
        .expect("valid metric definition");

        let client_teardowns_total = IntCounter::new(
            "athena_relay_client_teardowns_total",
            "Total number of client connections closed after a partial result",
        )
        .expect("valid metric definition");

        for collector in [
            Box::new(connections_active.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(write_blocked_total.clone()),
            Box::new(packets_forwarded_total.clone()),
            Box::new(packets_dropped_stale_total.clone()),
            Box::new(eof_rewrites_total.clone()),
            Box::new(retries_total.clone()),
            Box::new(abort_errors_total.clone()),
            Box::new(client_teardowns_total.clone()),
        ] {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        Self {
            registry,
            connections_active,
            write_blocked_total,
            packets_forwarded_total,
            packets_dropped_stale_total,
            eof_rewrites_total,
            retries_total,
            abort_errors_total,
            client_teardowns_total,
        }
    }

    /// Record an EOF rewrite by kind
    pub fn record_eof_rewrite(&self, kind: &str) {
        self.eof_rewrites_total.with_label_values(&[kind]).inc();
    }

    pub fn record_retry(&self, reason: &str) {
        self.retries_total.with_label_values(&[reason]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
