use bytes::Bytes;
use shared::models::{TokenEnvelope, destination_topic, is_valid_conversation_id};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::{
    bus::{BusError, BusSubscription, FanoutBus, MessageHandler},
    metrics::StreamMetrics,
};

/// Why a connection could not be subscribed.
#[derive(Debug, Error)]
pub enum SubscribeError {
    /// The id cannot be embedded in a bus topic.
    #[error("invalid conversation id '{0}'")]
    InvalidConversation(String),
    /// The bus refused the subscription.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Opens per-connection subscriptions on the fan-out bus.
#[derive(Clone)]
pub struct SubscriptionManager {
    bus: Arc<dyn FanoutBus>,
    queue_depth: usize,
    metrics: Arc<StreamMetrics>,
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("queue_depth", &self.queue_depth)
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    /// `queue_depth` is clamped to at least 1.
    pub fn new(bus: Arc<dyn FanoutBus>, queue_depth: usize, metrics: Arc<StreamMetrics>) -> Self {
        Self {
            bus,
            queue_depth: queue_depth.max(1),
            metrics,
        }
    }

    /// Subscribes to the conversation's topic.
    ///
    /// Envelopes with `sequence < start_sequence` never reach the queue. The callback runs
    /// on the bus delivery path and enqueues without blocking; when the queue is full the
    /// newest envelope is dropped.
    ///
    /// # Errors
    /// Returns [`SubscribeError`] for an unroutable id or when the bus refuses the
    /// subscription.
    pub async fn open(
        &self,
        conversation_id: &str,
        start_sequence: u64,
    ) -> Result<Subscription, SubscribeError> {
        if !is_valid_conversation_id(conversation_id) {
            return Err(SubscribeError::InvalidConversation(
                conversation_id.to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let handler = enqueue_handler(
            conversation_id.to_string(),
            start_sequence,
            tx,
            Arc::clone(&self.metrics),
        );

        let topic = destination_topic(conversation_id);
        let handle = self.bus.subscribe(&topic, handler).await?;
        debug!(conversation_id, start_sequence, topic = %topic, "subscription opened");

        Ok(Subscription {
            conversation_id: conversation_id.to_string(),
            receiver: rx,
            handle: Some(handle),
        })
    }
}

fn enqueue_handler(
    conversation_id: String,
    start_sequence: u64,
    queue: mpsc::Sender<TokenEnvelope>,
    metrics: Arc<StreamMetrics>,
) -> MessageHandler {
    Arc::new(move |payload: Bytes| {
        let envelope = match TokenEnvelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                metrics.malformed_envelope("delivery");
                warn!(conversation_id = %conversation_id, error = %err, "discarding malformed envelope");
                return;
            }
        };

        if envelope.conversation_id != conversation_id || envelope.sequence < start_sequence {
            return;
        }

        match queue.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                metrics.message_dropped();
                warn!(
                    conversation_id = %envelope.conversation_id,
                    sequence = envelope.sequence,
                    "message queue full, dropping message"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    })
}

/// Live subscription for one connection: the bus registration plus its bounded queue.
pub struct Subscription {
    conversation_id: String,
    receiver: mpsc::Receiver<TokenEnvelope>,
    handle: Option<Box<dyn BusSubscription>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("conversation_id", &self.conversation_id)
            .field("open", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Conversation this belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Next queued envelope; `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<TokenEnvelope> {
        self.receiver.recv().await
    }

    /// Unregisters from the bus. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.unsubscribe().await;
            self.receiver.close();
            debug!(conversation_id = %self.conversation_id, "subscription closed");
        }
    }

    /// Whether `close` already ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

/// Resume point for a client's `Last-Event-ID`.
///
/// A valid id `N` resumes at `N + 1`; a missing or unparsable id starts fresh at 0.
#[must_use]
pub fn start_sequence_from_last_event_id(last_event_id: Option<&str>) -> u64 {
    last_event_id
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map_or(0, |last| last.saturating_add(1))
}
