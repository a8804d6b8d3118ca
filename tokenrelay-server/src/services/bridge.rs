//! # Ingest bridge
//!
//! Drains the durable source through a wildcard subscription and republishes every valid
//! envelope, byte for byte, onto `chat.{conversation_id}.tokens`. Messages are handled one
//! at a time in receipt order; nothing is batched or reordered.

use bytes::Bytes;
use shared::models::TokenEnvelope;
use std::{fmt, sync::Arc, time::Instant};
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedupe::DedupeWindow;
use crate::{
    bus::{BusError, FanoutBus, SourceMessage, TokenSource},
    metrics::StreamMetrics,
};

/// Conditions that stop the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The source refused the pattern subscription.
    #[error("source subscription failed: {0}")]
    Subscribe(#[source] BusError),
    /// The source stream ended; the process should restart.
    #[error("source stream closed after {processed} messages")]
    SourceClosed {
        /// Messages handled before the stream ended.
        processed: u64,
    },
}

/// Counts for one bridge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Messages read from the source.
    pub processed: u64,
    /// Envelopes published to the fan-out bus.
    pub forwarded: u64,
    /// Envelopes skipped as duplicates.
    pub duplicates: u64,
    /// Payloads that failed to decode.
    pub malformed: u64,
    /// Publishes the fan-out bus rejected.
    pub publish_failures: u64,
}

/// Moves envelopes from the durable source onto the fan-out bus.
pub struct IngestBridge {
    source: Arc<dyn TokenSource>,
    bus: Arc<dyn FanoutBus>,
    pattern: String,
    dedupe: DedupeWindow,
    metrics: Arc<StreamMetrics>,
    stats: BridgeStats,
}

impl fmt::Debug for IngestBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestBridge")
            .field("pattern", &self.pattern)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl IngestBridge {
    /// Wires a bridge; nothing happens until [`IngestBridge::run`].
    pub fn new(
        source: Arc<dyn TokenSource>,
        bus: Arc<dyn FanoutBus>,
        pattern: impl Into<String>,
        dedupe: DedupeWindow,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            source,
            bus,
            pattern: pattern.into(),
            dedupe,
            metrics,
            stats: BridgeStats::default(),
        }
    }

    /// Relays until `cancel` fires.
    ///
    /// # Errors
    /// Returns [`BridgeError::Subscribe`] when the source subscription cannot be
    /// established and [`BridgeError::SourceClosed`] when the source stream ends.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<BridgeStats, BridgeError> {
        let mut messages = self
            .source
            .psubscribe(&self.pattern)
            .await
            .map_err(BridgeError::Subscribe)?;
        info!(pattern = %self.pattern, "starting message processing loop");

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(messages_processed = self.stats.processed, "shutting down");
                    return Ok(self.stats);
                }
                message = messages.next() => match message {
                    Some(message) => self.relay(message).await,
                    None => {
                        error!(messages_processed = self.stats.processed, "source stream closed");
                        return Err(BridgeError::SourceClosed {
                            processed: self.stats.processed,
                        });
                    }
                },
            }
        }
    }

    async fn relay(&mut self, message: SourceMessage) {
        self.stats.processed += 1;

        let envelope = match TokenEnvelope::decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.stats.malformed += 1;
                self.metrics.malformed_envelope("bridge");
                warn!(
                    channel = %message.channel,
                    error = %err,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "failed to decode message"
                );
                return;
            }
        };

        let now = Instant::now();
        if self
            .dedupe
            .contains(&envelope.conversation_id, envelope.sequence, now)
        {
            self.stats.duplicates += 1;
            self.metrics.duplicate_suppressed();
            debug!(
                conversation_id = %envelope.conversation_id,
                sequence = envelope.sequence,
                "duplicate suppressed"
            );
            return;
        }

        let subject = envelope.destination_topic();
        let payload: Bytes = message.payload;
        if let Err(err) = self.bus.publish(&subject, payload).await {
            self.stats.publish_failures += 1;
            self.metrics.publish_failed();
            error!(
                subject = %subject,
                conversation_id = %envelope.conversation_id,
                sequence = envelope.sequence,
                error = %err,
                "failed to publish to bus"
            );
            return;
        }

        self.dedupe
            .record(&envelope.conversation_id, envelope.sequence, now);
        self.stats.forwarded += 1;
        self.metrics.envelope_bridged();
        debug!(
            subject = %subject,
            conversation_id = %envelope.conversation_id,
            sequence = envelope.sequence,
            done = envelope.done,
            "message bridged"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MemorySource, MessageHandler, SourcePublisher};
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    struct Fixture {
        source: MemorySource,
        bus: MemoryBus,
        metrics: Arc<StreamMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                source: MemorySource::default(),
                bus: MemoryBus::default(),
                metrics: Arc::new(StreamMetrics::default()),
            }
        }

        fn bridge(&self, window: Duration) -> IngestBridge {
            IngestBridge::new(
                Arc::new(self.source.clone()),
                Arc::new(self.bus.clone()),
                "llm:tokens:*",
                DedupeWindow::new(window),
                Arc::clone(&self.metrics),
            )
        }

        async fn emit(&self, envelope: &TokenEnvelope) {
            self.emit_raw(
                &format!("llm:tokens:{}", envelope.conversation_id),
                envelope.encode().unwrap(),
            )
            .await;
        }

        async fn emit_raw(&self, channel: &str, payload: Vec<u8>) {
            self.source
                .publish(channel, Bytes::from(payload))
                .await
                .unwrap();
        }
    }

    fn recorder() -> (MessageHandler, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            Arc::new(move |payload: Bytes| sink.lock().unwrap().push(payload)),
            seen,
        )
    }

    async fn wait_for_subscription(source: &MemorySource) {
        while source.pattern_count() == 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn forwards_unmodified_bytes_in_order_and_suppresses_duplicates() {
        let fixture = Fixture::new();
        let (handler, seen) = recorder();
        let _subscription = fixture.bus.subscribe("chat.c1.tokens", handler).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(fixture.bridge(Duration::from_secs(30)).run(cancel.clone()));
        wait_for_subscription(&fixture.source).await;

        let first = TokenEnvelope::new("c1", "Hel", 1, false);
        let second = TokenEnvelope::new("c1", "lo", 2, true);
        fixture.emit(&first).await;
        fixture.emit(&first).await;
        fixture.emit(&second).await;
        fixture
            .emit_raw("llm:tokens:c1", b"not an envelope".to_vec())
            .await;

        while fixture.metrics.snapshot().malformed_envelopes == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let stats = task.await.unwrap().unwrap();

        let delivered = seen.lock().unwrap().clone();
        assert_eq!(
            delivered,
            vec![
                Bytes::from(first.encode().unwrap()),
                Bytes::from(second.encode().unwrap())
            ]
        );
        assert_eq!(stats.forwarded, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.processed, 4);
    }

    #[tokio::test]
    async fn publish_failures_are_counted_and_not_remembered() {
        let fixture = Fixture::new();
        fixture.bus.set_connected(false);
        let mut bridge = fixture.bridge(Duration::from_secs(30));

        let envelope = TokenEnvelope::new("c1", "x", 1, false);
        let message = SourceMessage {
            channel: "llm:tokens:c1".into(),
            payload: Bytes::from(envelope.encode().unwrap()),
        };
        bridge.relay(message.clone()).await;
        assert_eq!(bridge.stats.publish_failures, 1);

        fixture.bus.set_connected(true);
        bridge.relay(message).await;
        assert_eq!(bridge.stats.forwarded, 1);
        assert_eq!(bridge.stats.duplicates, 0);
        assert_eq!(fixture.metrics.snapshot().bridge_publish_failures, 1);
    }

    #[tokio::test]
    async fn zero_window_forwards_every_copy() {
        let fixture = Fixture::new();
        let mut bridge = fixture.bridge(Duration::ZERO);
        let envelope = TokenEnvelope::new("c1", "x", 1, false);
        let message = SourceMessage {
            channel: "llm:tokens:c1".into(),
            payload: Bytes::from(envelope.encode().unwrap()),
        };

        bridge.relay(message.clone()).await;
        bridge.relay(message).await;
        assert_eq!(bridge.stats.forwarded, 2);
    }

    #[tokio::test]
    async fn subscribe_failure_is_fatal() {
        let fixture = Fixture::new();
        fixture.source.refuse_subscriptions();
        let result = fixture
            .bridge(Duration::from_secs(30))
            .run(CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BridgeError::Subscribe(_))));
    }

    #[tokio::test]
    async fn closed_source_ends_the_run_with_an_error() {
        let fixture = Fixture::new();
        let task = tokio::spawn(
            fixture
                .bridge(Duration::from_secs(30))
                .run(CancellationToken::new()),
        );
        wait_for_subscription(&fixture.source).await;
        fixture.source.close_all();

        assert!(matches!(
            task.await.unwrap(),
            Err(BridgeError::SourceClosed { .. })
        ));
    }
}
