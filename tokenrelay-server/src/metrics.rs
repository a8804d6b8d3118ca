//! # Stream metrics
//!
//! [`StreamMetrics`] is the single sink every component reports into. It is built once per
//! process and handed to the delivery engine, the orchestrator and the bridge explicitly.
//! Each event is emitted through the `metrics` facade (exported by Prometheus on
//! `GET /metrics`) and also tallied locally so tests and shutdown logs can read it.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::{
    sync::{
        OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::warn;

const CONNECTIONS_TOTAL: &str = "tokenrelay_connections_total";
const CONNECTIONS_ACTIVE: &str = "tokenrelay_connections_active";
const CONNECTION_DURATION: &str = "tokenrelay_connection_duration_seconds";
const MESSAGES_DELIVERED: &str = "tokenrelay_messages_delivered_total";
const MESSAGES_DROPPED: &str = "tokenrelay_messages_dropped_total";
const MALFORMED_ENVELOPES: &str = "tokenrelay_malformed_envelopes_total";
const BRIDGE_FORWARDED: &str = "tokenrelay_bridge_forwarded_total";
const BRIDGE_DUPLICATES: &str = "tokenrelay_bridge_duplicates_total";
const BRIDGE_PUBLISH_FAILURES: &str = "tokenrelay_bridge_publish_failures_total";
const FIRST_TOKEN_TIMEOUTS: &str = "tokenrelay_first_token_timeouts_total";
const FORWARD_FAILURES: &str = "tokenrelay_forward_failures_total";

const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

static PROMETHEUS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Installs the Prometheus recorder on first use and returns its render handle.
///
/// Returns `None` when another recorder already owns the process.
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    Matcher::Full(CONNECTION_DURATION.to_string()),
                    DURATION_BUCKETS,
                )
                .unwrap_or_else(|_| PrometheusBuilder::new());
            match builder.install_recorder() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(error = %err, "failed to install Prometheus recorder");
                    None
                }
            }
        })
        .clone()
}

/// Point-in-time copy of the local tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections opened since start.
    pub connections_opened: u64,
    /// Opened minus closed.
    pub connections_active: u64,
    /// Token events written to clients.
    pub messages_delivered: u64,
    /// Envelopes discarded because a connection queue was full.
    pub messages_dropped: u64,
    /// Payloads that failed to decode, at any stage.
    pub malformed_envelopes: u64,
    /// Envelopes the bridge published.
    pub bridge_forwarded: u64,
    /// Envelopes suppressed by the dedupe window.
    pub bridge_duplicates: u64,
    /// Bridge publishes the bus rejected.
    pub bridge_publish_failures: u64,
    /// Orchestrated streams closed by the first-token deadline.
    pub first_token_timeouts: u64,
    /// Prompts the generation origin did not accept.
    pub forward_failures: u64,
}

/// Shared counters for delivery, bridging and forwarding.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    connections_opened: AtomicU64,
    connections_active: AtomicU64,
    messages_delivered: AtomicU64,
    messages_dropped: AtomicU64,
    malformed_envelopes: AtomicU64,
    bridge_forwarded: AtomicU64,
    bridge_duplicates: AtomicU64,
    bridge_publish_failures: AtomicU64,
    first_token_timeouts: AtomicU64,
    forward_failures: AtomicU64,
}

impl StreamMetrics {
    /// Records a newly opened connection.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        counter!(CONNECTIONS_TOTAL).increment(1);
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    }

    /// Records a closed connection and how long it stayed open.
    pub fn connection_closed(&self, duration: Duration) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |active| {
                active.checked_sub(1)
            });
        gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        histogram!(CONNECTION_DURATION).record(duration.as_secs_f64());
    }

    /// Records one token event written to a client.
    pub fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
        counter!(MESSAGES_DELIVERED).increment(1);
    }

    /// Backpressure drop on a connection queue.
    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        counter!(MESSAGES_DROPPED).increment(1);
    }

    /// `stage` labels where decoding failed (`bridge` or `delivery`).
    pub fn malformed_envelope(&self, stage: &'static str) {
        self.malformed_envelopes.fetch_add(1, Ordering::Relaxed);
        counter!(MALFORMED_ENVELOPES, "stage" => stage).increment(1);
    }

    /// Records one envelope forwarded by the bridge.
    pub fn envelope_bridged(&self) {
        self.bridge_forwarded.fetch_add(1, Ordering::Relaxed);
        counter!(BRIDGE_FORWARDED).increment(1);
    }

    /// Records one duplicate the bridge skipped.
    pub fn duplicate_suppressed(&self) {
        self.bridge_duplicates.fetch_add(1, Ordering::Relaxed);
        counter!(BRIDGE_DUPLICATES).increment(1);
    }

    /// A bridge publish to the fan-out bus failed.
    pub fn publish_failed(&self) {
        self.bridge_publish_failures.fetch_add(1, Ordering::Relaxed);
        counter!(BRIDGE_PUBLISH_FAILURES).increment(1);
    }

    /// Records a first-token timeout.
    pub fn first_token_timeout(&self) {
        self.first_token_timeouts.fetch_add(1, Ordering::Relaxed);
        counter!(FIRST_TOKEN_TIMEOUTS).increment(1);
    }

    /// Records a forwarding failure.
    pub fn upstream_failed(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
        counter!(FORWARD_FAILURES).increment(1);
    }

    /// Reads every local tally.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            malformed_envelopes: self.malformed_envelopes.load(Ordering::Relaxed),
            bridge_forwarded: self.bridge_forwarded.load(Ordering::Relaxed),
            bridge_duplicates: self.bridge_duplicates.load(Ordering::Relaxed),
            bridge_publish_failures: self.bridge_publish_failures.load(Ordering::Relaxed),
            first_token_timeouts: self.first_token_timeouts.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_connections_never_underflow() {
        let metrics = StreamMetrics::default();
        metrics.connection_opened();
        metrics.connection_closed(Duration::from_secs(1));
        metrics.connection_closed(Duration::from_secs(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 1);
        assert_eq!(snapshot.connections_active, 0);
    }

    #[test]
    fn tallies_track_each_event() {
        let metrics = StreamMetrics::default();
        metrics.message_delivered();
        metrics.message_delivered();
        metrics.message_dropped();
        metrics.malformed_envelope("bridge");
        metrics.duplicate_suppressed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_delivered, 2);
        assert_eq!(snapshot.messages_dropped, 1);
        assert_eq!(snapshot.malformed_envelopes, 1);
        assert_eq!(snapshot.bridge_duplicates, 1);
        assert_eq!(snapshot.bridge_forwarded, 0);
    }

    #[test]
    fn prometheus_handle_is_shared() {
        let first = prometheus_handle();
        let second = prometheus_handle();
        assert_eq!(first.is_some(), second.is_some());
    }
}
