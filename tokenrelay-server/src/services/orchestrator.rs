use shared::models::{ChatRequest, ConnectedEvent, is_valid_conversation_id};
use std::{fmt, sync::Arc};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::forwarder::GenerationOrigin;
use crate::delivery::{CloseReason, Connection, DeliveryEngine, EventSink, SseFrame, SubscribeError};

/// Failures reported before a chat stream starts.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The prompt was blank.
    #[error("message is required")]
    EmptyMessage,
    /// The supplied id cannot be routed.
    #[error("invalid conversation id '{0}'")]
    InvalidConversation(String),
    /// The process was started without a generation origin.
    #[error("no generation origin is configured")]
    OriginUnavailable,
    /// Subscribing to the conversation failed.
    #[error("failed to subscribe: {0}")]
    Subscribe(#[from] SubscribeError),
}

/// "Submit a prompt, get a stream back."
#[derive(Clone)]
pub struct ChatOrchestrator {
    engine: DeliveryEngine,
    origin: Option<Arc<dyn GenerationOrigin>>,
}

impl fmt::Debug for ChatOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatOrchestrator")
            .field("origin_configured", &self.origin.is_some())
            .finish_non_exhaustive()
    }
}

impl ChatOrchestrator {
    /// `origin` is `None` when `POST /chat` is disabled.
    pub fn new(engine: DeliveryEngine, origin: Option<Arc<dyn GenerationOrigin>>) -> Self {
        Self { engine, origin }
    }

    /// Validates the request and subscribes to the conversation before anything is
    /// generated, so no token can be published ahead of the subscription.
    ///
    /// # Errors
    /// Returns [`ChatError`] for an empty prompt, an unroutable conversation id, a missing
    /// origin, or a failed subscription.
    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedChat, ChatError> {
        let origin = self.origin.clone().ok_or(ChatError::OriginUnavailable)?;

        if request.message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let conversation_id = match request.conversation_id {
            Some(id) if is_valid_conversation_id(&id) => id,
            Some(id) => return Err(ChatError::InvalidConversation(id)),
            None => Uuid::new_v4().to_string(),
        };

        let connection = self.engine.connect(&conversation_id, 0).await?;
        info!(
            conversation_id = %conversation_id,
            conn_id = connection.id(),
            message_length = request.message.len(),
            "chat request received"
        );

        Ok(PreparedChat {
            engine: self.engine.clone(),
            origin,
            connection,
            message: request.message,
        })
    }
}

/// A subscribed chat whose prompt has not been forwarded yet.
pub struct PreparedChat {
    engine: DeliveryEngine,
    origin: Arc<dyn GenerationOrigin>,
    connection: Connection,
    message: String,
}

impl fmt::Debug for PreparedChat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedChat")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl PreparedChat {
    /// Conversation this belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        self.connection.conversation_id()
    }

    /// Writes the `connected` event, forwards the prompt in the background and streams
    /// until the connection closes.
    pub async fn stream<S>(self, sink: &mut S, disconnect: CancellationToken) -> CloseReason
    where
        S: EventSink + ?Sized,
    {
        let conversation_id = self.connection.conversation_id().to_string();
        let connected = serde_json::to_string(&ConnectedEvent {
            conversation_id: conversation_id.clone(),
        })
        .unwrap_or_default();

        let (slot, upstream) = oneshot::channel();
        let greeted = sink
            .write_frame(&SseFrame::event("connected", None, connected))
            .await
            .is_ok()
            && sink.flush().await.is_ok();

        if greeted {
            let origin = self.origin;
            let message = self.message;
            tokio::spawn(async move {
                if let Err(err) = origin.submit(&conversation_id, &message).await {
                    if slot.send(err).is_err() {
                        warn!(conversation_id = %conversation_id, "forwarding failed after the stream closed");
                    }
                }
            });
        } else {
            disconnect.cancel();
        }

        self.engine
            .await_first(self.connection, sink, disconnect, upstream)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{FanoutBus, MemoryBus},
        delivery::sink::testing::RecordingSink,
        metrics::StreamMetrics,
        services::forwarder::ForwardError,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use shared::{
        config::server::DeliveryConfig,
        models::{StreamErrorEvent, TokenEnvelope},
    };
    use std::sync::Mutex;

    /// Origin that "generates" by publishing straight onto the bus.
    struct ScriptedOrigin {
        bus: MemoryBus,
        tokens: Vec<&'static str>,
        failure: Option<ForwardError>,
        submitted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationOrigin for ScriptedOrigin {
        async fn submit(&self, conversation_id: &str, _message: &str) -> Result<(), ForwardError> {
            self.submitted
                .lock()
                .unwrap()
                .push(conversation_id.to_string());
            if let Some(err) = self.failure.clone() {
                return Err(err);
            }
            let last = self.tokens.len();
            for (index, token) in self.tokens.iter().enumerate() {
                let envelope = TokenEnvelope::new(
                    conversation_id,
                    *token,
                    u64::try_from(index + 1).unwrap(),
                    index + 1 == last,
                );
                self.bus
                    .publish(
                        &envelope.destination_topic(),
                        Bytes::from(envelope.encode().unwrap()),
                    )
                    .await
                    .unwrap();
            }
            Ok(())
        }
    }

    fn orchestrator(origin: Option<Arc<ScriptedOrigin>>, bus: &MemoryBus) -> ChatOrchestrator {
        let engine = DeliveryEngine::new(
            Arc::new(bus.clone()),
            &DeliveryConfig::default(),
            Arc::new(StreamMetrics::default()),
        );
        ChatOrchestrator::new(engine, origin.map(|o| o as Arc<dyn GenerationOrigin>))
    }

    fn request(message: &str, conversation_id: Option<&str>) -> ChatRequest {
        ChatRequest {
            message: message.into(),
            conversation_id: conversation_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn streams_connected_then_tokens() {
        let bus = MemoryBus::default();
        let origin = Arc::new(ScriptedOrigin {
            bus: bus.clone(),
            tokens: vec!["Hel", "lo", ""],
            failure: None,
            submitted: Mutex::new(Vec::new()),
        });
        let chat = orchestrator(Some(Arc::clone(&origin)), &bus)
            .prepare(request("hi", Some("c1")))
            .await
            .unwrap();
        assert_eq!(chat.conversation_id(), "c1");

        let mut sink = RecordingSink::default();
        let reason = chat.stream(&mut sink, CancellationToken::new()).await;

        assert_eq!(reason, CloseReason::Completed { final_sequence: 3 });
        let frames = sink.frames();
        assert_eq!(
            frames[0],
            SseFrame::event("connected", None, r#"{"conversation_id":"c1"}"#)
        );
        assert_eq!(frames.len(), 4);
        assert_eq!(*origin.submitted.lock().unwrap(), vec!["c1".to_string()]);
        assert_eq!(bus.subscriber_count("chat.c1.tokens"), 0);
    }

    #[tokio::test]
    async fn assigns_a_uuid_when_no_conversation_is_supplied() {
        let bus = MemoryBus::default();
        let origin = Arc::new(ScriptedOrigin {
            bus: bus.clone(),
            tokens: Vec::new(),
            failure: None,
            submitted: Mutex::new(Vec::new()),
        });
        let chat = orchestrator(Some(origin), &bus)
            .prepare(request("hi", None))
            .await
            .unwrap();
        assert!(Uuid::parse_str(chat.conversation_id()).is_ok());
    }

    #[tokio::test]
    async fn forwarding_failure_becomes_an_error_event() {
        let bus = MemoryBus::default();
        let origin = Arc::new(ScriptedOrigin {
            bus: bus.clone(),
            tokens: Vec::new(),
            failure: Some(ForwardError::Status(500)),
            submitted: Mutex::new(Vec::new()),
        });
        let chat = orchestrator(Some(origin), &bus)
            .prepare(request("hi", None))
            .await
            .unwrap();

        let mut sink = RecordingSink::default();
        let reason = chat.stream(&mut sink, CancellationToken::new()).await;

        assert_eq!(
            reason,
            CloseReason::UpstreamError(ForwardError::Status(500).to_string())
        );
        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        let SseFrame::Event { event, data, .. } = &frames[1] else {
            panic!("expected error event");
        };
        assert_eq!(*event, "error");
        let payload: StreamErrorEvent = serde_json::from_str(data).unwrap();
        assert_eq!(payload.error, "origin error: 500");
    }

    #[tokio::test]
    async fn rejects_bad_requests_before_subscribing() {
        let bus = MemoryBus::default();
        let origin = Arc::new(ScriptedOrigin {
            bus: bus.clone(),
            tokens: Vec::new(),
            failure: None,
            submitted: Mutex::new(Vec::new()),
        });
        let orchestrator = orchestrator(Some(origin), &bus);

        assert!(matches!(
            orchestrator.prepare(request("   ", None)).await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(matches!(
            orchestrator.prepare(request("hi", Some("a.b"))).await,
            Err(ChatError::InvalidConversation(_))
        ));
        assert_eq!(bus.subscriber_count("chat.a.b.tokens"), 0);
    }

    #[tokio::test]
    async fn missing_origin_is_reported() {
        let bus = MemoryBus::default();
        assert!(matches!(
            orchestrator(None, &bus).prepare(request("hi", None)).await,
            Err(ChatError::OriginUnavailable)
        ));
    }
}
