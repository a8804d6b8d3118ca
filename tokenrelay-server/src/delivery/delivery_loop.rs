//! Per-connection delivery state machine.
//!
//! One loop owns one [`Connection`]. Each iteration waits for the first ready wake-up, in
//! priority order: client disconnect, queued envelope, keep-alive tick, first-token deadline,
//! upstream forwarding result. Nothing is written after the loop leaves, and the subscription
//! is always released on the way out.

use shared::models::{StreamErrorEvent, TokenEnvelope};
use std::{future, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    sync::oneshot,
    time::{Instant, MissedTickBehavior, Sleep, interval_at, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    connection::Connection,
    frame::SseFrame,
    sink::{EventSink, SinkClosed},
};
use crate::{metrics::StreamMetrics, services::forwarder::ForwardError};

/// Error text sent when no envelope arrives before the first-token deadline.
pub const FIRST_TOKEN_TIMEOUT_MESSAGE: &str = "timeout waiting for response";

/// Phase of a [`DeliveryLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Orchestrated stream with no envelope delivered yet.
    AwaitingFirst,
    /// At least one envelope delivered, or a plain resumable stream.
    Streaming,
    /// Teardown done; nothing more is written.
    Closed,
}

/// Why a delivery loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away or its transport refused a write.
    ClientDisconnected,
    /// The terminal envelope was delivered.
    Completed {
        /// Sequence of the terminal envelope.
        final_sequence: u64,
    },
    /// No envelope arrived before the first-token deadline.
    FirstTokenTimeout,
    /// Forwarding the prompt failed before the first token.
    UpstreamError(String),
    /// The bus dropped the subscription underneath the connection.
    SubscriptionEnded,
}

/// Per-connection timer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTimings {
    /// Idle gap between `: keep-alive` comments.
    pub keep_alive: Duration,
    /// How long an orchestrated stream waits for its first envelope.
    pub first_token_timeout: Duration,
}

impl Default for DeliveryTimings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(15),
            first_token_timeout: Duration::from_secs(30),
        }
    }
}

enum Wake {
    Disconnected,
    Envelope(TokenEnvelope),
    SubscriptionEnded,
    KeepAlive,
    FirstTokenDeadline,
    Upstream(Option<ForwardError>),
}

type UpstreamSlot = Option<oneshot::Receiver<ForwardError>>;

/// State machine driving one connection from open to close.
pub struct DeliveryLoop {
    connection: Connection,
    state: LoopState,
    timings: DeliveryTimings,
    metrics: Arc<StreamMetrics>,
    upstream: UpstreamSlot,
    first_token: Option<Pin<Box<Sleep>>>,
    last_sequence: u64,
}

impl std::fmt::Debug for DeliveryLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryLoop")
            .field("connection", &self.connection.id())
            .field("state", &self.state)
            .field("last_sequence", &self.last_sequence)
            .finish_non_exhaustive()
    }
}

impl DeliveryLoop {
    /// Plain streaming loop, as used for `GET /stream/{conversation_id}`.
    #[must_use]
    pub fn streaming(
        connection: Connection,
        timings: DeliveryTimings,
        metrics: Arc<StreamMetrics>,
    ) -> Self {
        Self {
            last_sequence: connection.start_sequence.saturating_sub(1),
            connection,
            state: LoopState::Streaming,
            timings,
            metrics,
            upstream: None,
            first_token: None,
        }
    }

    /// Orchestrated loop: waits for the first envelope, bounded by the first-token
    /// deadline measured from when the subscription was opened.
    ///
    /// A dropped `upstream` sender means forwarding succeeded.
    #[must_use]
    pub fn awaiting_first(
        connection: Connection,
        timings: DeliveryTimings,
        metrics: Arc<StreamMetrics>,
        upstream: oneshot::Receiver<ForwardError>,
    ) -> Self {
        let deadline = connection.opened_at + timings.first_token_timeout;
        Self {
            last_sequence: connection.start_sequence.saturating_sub(1),
            connection,
            state: LoopState::AwaitingFirst,
            timings,
            metrics,
            upstream: Some(upstream),
            first_token: Some(Box::pin(sleep_until(deadline))),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Drives the connection until it closes.
    pub async fn run<S>(mut self, sink: &mut S, disconnect: CancellationToken) -> CloseReason
    where
        S: EventSink + ?Sized,
    {
        let cadence = self.timings.keep_alive;
        let mut keep_alive = interval_at(Instant::now() + cadence, cadence);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            let wake = tokio::select! {
                biased;
                () = disconnect.cancelled() => Wake::Disconnected,
                envelope = self.connection.subscription.recv() => match envelope {
                    Some(envelope) => Wake::Envelope(envelope),
                    None => Wake::SubscriptionEnded,
                },
                _ = keep_alive.tick() => Wake::KeepAlive,
                () = first_token_deadline(&mut self.first_token) => Wake::FirstTokenDeadline,
                outcome = upstream_outcome(&mut self.upstream) => Wake::Upstream(outcome),
            };

            if let Some(reason) = self.process(wake, sink).await {
                break reason;
            }
        };

        self.shutdown(&reason).await;
        reason
    }

    async fn process<S>(&mut self, wake: Wake, sink: &mut S) -> Option<CloseReason>
    where
        S: EventSink + ?Sized,
    {
        match wake {
            Wake::Disconnected => Some(CloseReason::ClientDisconnected),
            Wake::SubscriptionEnded => Some(CloseReason::SubscriptionEnded),
            Wake::Envelope(envelope) => self.deliver(envelope, sink).await,
            Wake::KeepAlive => send(sink, &SseFrame::keep_alive())
                .await
                .err()
                .map(|_| CloseReason::ClientDisconnected),
            Wake::FirstTokenDeadline => {
                self.first_token = None;
                if self.state != LoopState::AwaitingFirst {
                    return None;
                }
                self.metrics.first_token_timeout();
                warn!(
                    conversation_id = %self.connection.conversation_id,
                    conn_id = self.connection.id(),
                    "timeout waiting for first token"
                );
                // The stream ends either way; a closed sink changes nothing.
                let _ = send(sink, &error_frame(FIRST_TOKEN_TIMEOUT_MESSAGE)).await;
                Some(CloseReason::FirstTokenTimeout)
            }
            Wake::Upstream(None) => {
                self.upstream = None;
                None
            }
            Wake::Upstream(Some(err)) => {
                self.upstream = None;
                self.metrics.upstream_failed();
                if self.state != LoopState::AwaitingFirst {
                    warn!(
                        conversation_id = %self.connection.conversation_id,
                        error = %err,
                        "forwarding failed after streaming started"
                    );
                    return None;
                }
                warn!(
                    conversation_id = %self.connection.conversation_id,
                    error = %err,
                    "forwarding to origin failed"
                );
                let _ = send(sink, &error_frame(&err.to_string())).await;
                Some(CloseReason::UpstreamError(err.to_string()))
            }
        }
    }

    async fn deliver<S>(&mut self, envelope: TokenEnvelope, sink: &mut S) -> Option<CloseReason>
    where
        S: EventSink + ?Sized,
    {
        if envelope.sequence <= self.last_sequence {
            debug!(
                conversation_id = %envelope.conversation_id,
                sequence = envelope.sequence,
                last_sequence = self.last_sequence,
                "skipping out-of-order envelope"
            );
            return None;
        }

        let data = match serde_json::to_string(&envelope) {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    conversation_id = %envelope.conversation_id,
                    sequence = envelope.sequence,
                    error = %err,
                    "failed to serialize envelope"
                );
                return None;
            }
        };

        if self.state == LoopState::AwaitingFirst {
            self.state = LoopState::Streaming;
            self.first_token = None;
        }
        self.last_sequence = envelope.sequence;

        let frame = SseFrame::event("token", Some(envelope.sequence), data);
        if send(sink, &frame).await.is_err() {
            return Some(CloseReason::ClientDisconnected);
        }
        self.metrics.message_delivered();

        if envelope.done {
            info!(
                conversation_id = %envelope.conversation_id,
                final_sequence = envelope.sequence,
                "stream completed"
            );
            return Some(CloseReason::Completed {
                final_sequence: envelope.sequence,
            });
        }
        None
    }

    async fn shutdown(&mut self, reason: &CloseReason) {
        self.state = LoopState::Closed;
        self.first_token = None;
        self.upstream = None;
        self.connection.subscription.close().await;

        let duration = self.connection.opened_at.elapsed();
        self.metrics.connection_closed(duration);
        info!(
            conversation_id = %self.connection.conversation_id,
            conn_id = self.connection.id(),
            reason = ?reason,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "connection closed"
        );
    }
}

async fn send<S>(sink: &mut S, frame: &SseFrame) -> Result<(), SinkClosed>
where
    S: EventSink + ?Sized,
{
    sink.write_frame(frame).await?;
    sink.flush().await
}

pub(crate) fn error_frame(message: &str) -> SseFrame {
    let data = serde_json::to_string(&StreamErrorEvent::new(message))
        .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string());
    SseFrame::event("error", None, data)
}

async fn first_token_deadline(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

/// Resolves with the forwarding error, or `None` once the sender is gone without one.
async fn upstream_outcome(slot: &mut UpstreamSlot) -> Option<ForwardError> {
    match slot {
        Some(receiver) => receiver.await.ok(),
        None => future::pending().await,
    }
}
