//! # Delivery engine
//!
//! Turns fan-out bus traffic for one conversation into an ordered, resumable SSE stream.
//!
//! - [`subscription`]: one bus subscription per connection, feeding a bounded queue.
//! - [`delivery_loop`]: the per-connection state machine.
//! - [`connection`]: connection identity and the process-wide registry.
//! - [`sink`] / [`frame`]: the response writer seam and SSE framing.

use shared::config::server::DeliveryConfig;
use std::sync::Arc;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Live connection bookkeeping.
pub mod connection;
/// Per-connection event loop.
pub mod delivery_loop;
/// SSE wire frames.
pub mod frame;
/// Output seam the loop writes frames to.
pub mod sink;
/// Bus subscription and bounded queue per connection.
pub mod subscription;

pub use connection::{Connection, ConnectionRegistry};
pub use delivery_loop::{CloseReason, DeliveryLoop, DeliveryTimings, LoopState};
pub use frame::SseFrame;
pub use sink::{EventSink, Flush, SinkClosed};
pub use subscription::{
    SubscribeError, Subscription, SubscriptionManager, start_sequence_from_last_event_id,
};

use crate::{bus::FanoutBus, metrics::StreamMetrics, services::forwarder::ForwardError};

/// Entry point for opening and running client connections.
#[derive(Debug, Clone)]
pub struct DeliveryEngine {
    subscriptions: SubscriptionManager,
    registry: Arc<ConnectionRegistry>,
    timings: DeliveryTimings,
    metrics: Arc<StreamMetrics>,
}

impl DeliveryEngine {
    /// Builds the engine over a shared bus handle.
    pub fn new(bus: Arc<dyn FanoutBus>, config: &DeliveryConfig, metrics: Arc<StreamMetrics>) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(bus, config.queue_depth, Arc::clone(&metrics)),
            registry: Arc::new(ConnectionRegistry::default()),
            timings: DeliveryTimings {
                keep_alive: config.keep_alive(),
                first_token_timeout: config.first_token_timeout(),
            },
            metrics,
        }
    }

    /// Live connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Metrics sink shared with every connection.
    #[must_use]
    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    /// Subscribes a new connection for `conversation_id`, resuming at `start_sequence`.
    ///
    /// # Errors
    /// Returns [`SubscribeError`] when the bus subscription cannot be opened.
    pub async fn connect(
        &self,
        conversation_id: &str,
        start_sequence: u64,
    ) -> Result<Connection, SubscribeError> {
        let opened_at = Instant::now();
        let subscription = self.subscriptions.open(conversation_id, start_sequence).await?;
        let ticket = self.registry.register(conversation_id);
        self.metrics.connection_opened();
        info!(
            conversation_id,
            conn_id = ticket.id(),
            start_sequence,
            "connection opened"
        );

        Ok(Connection {
            ticket,
            conversation_id: conversation_id.to_string(),
            start_sequence,
            opened_at,
            subscription,
        })
    }

    /// Streams a plain subscription: a `connected to` comment, then token events.
    pub async fn resume<S>(
        &self,
        connection: Connection,
        sink: &mut S,
        disconnect: CancellationToken,
    ) -> CloseReason
    where
        S: EventSink + ?Sized,
    {
        let greeting = SseFrame::comment(format!("connected to {}", connection.conversation_id));
        let stream = DeliveryLoop::streaming(connection, self.timings, Arc::clone(&self.metrics));
        if sink.write_frame(&greeting).await.is_err() || sink.flush().await.is_err() {
            disconnect.cancel();
        }
        stream.run(sink, disconnect).await
    }

    /// Streams an orchestrated connection that has not seen its first envelope yet.
    pub async fn await_first<S>(
        &self,
        connection: Connection,
        sink: &mut S,
        disconnect: CancellationToken,
        upstream: oneshot::Receiver<ForwardError>,
    ) -> CloseReason
    where
        S: EventSink + ?Sized,
    {
        DeliveryLoop::awaiting_first(connection, self.timings, Arc::clone(&self.metrics), upstream)
            .run(sink, disconnect)
            .await
    }
}
