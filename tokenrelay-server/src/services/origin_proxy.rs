//! # Origin stream proxy
//!
//! Turns one prompt into a token stream on the durable source. The prompt goes to an
//! OpenAI-compatible `POST /v1/chat/completions` with `stream: true`; every non-empty delta
//! becomes one envelope on `{channel_prefix}{conversation_id}` with sequences starting at 1,
//! followed by a terminal `[DONE]` envelope. Upstream failures publish a terminal `[ERROR]`
//! envelope instead so subscribers never wait forever.

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use shared::{config::server::InferenceConfig, models::TokenEnvelope};
use std::{fmt, sync::Arc};
use tracing::{debug, error, info, warn};

use crate::bus::SourcePublisher;

/// Token of the terminal envelope after a successful generation.
pub const DONE_TOKEN: &str = "[DONE]";
/// Token of the terminal envelope after a failed generation.
pub const ERROR_TOKEN: &str = "[ERROR]";

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: [CompletionMessage<'a>; 1],
    stream: bool,
}

#[derive(Debug, Serialize)]
struct CompletionMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one completion `data:` line carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    /// Non-empty content fragment.
    Delta(String),
    /// `[DONE]` or a `finish_reason`.
    Finished,
}

/// Incremental parser for the `data:` lines of a streamed completion.
#[derive(Debug, Default)]
pub struct CompletionStreamParser {
    buffer: Vec<u8>,
}

impl CompletionStreamParser {
    /// Feeds raw body bytes; returns the events of every completed line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<CompletionEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            parse_line(&String::from_utf8_lossy(&line), &mut events);
        }
        events
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            parse_line(&String::from_utf8_lossy(&line), &mut events);
        }
        events
    }
}

fn parse_line(line: &str, events: &mut Vec<CompletionEvent>) {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return;
    };
    let data = data.trim_start();
    if data == DONE_TOKEN {
        events.push(CompletionEvent::Finished);
        return;
    }

    let Ok(chunk) = serde_json::from_str::<CompletionChunk>(data) else {
        debug!(line = data, "skipping unparsable completion chunk");
        return;
    };
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            events.push(CompletionEvent::Delta(content));
        }
        if choice.finish_reason.is_some() {
            events.push(CompletionEvent::Finished);
        }
    }
}

/// Publishes one conversation's envelopes in sequence order.
struct ConversationWriter<'a> {
    publisher: &'a dyn SourcePublisher,
    conversation_id: &'a str,
    channel: String,
    sequence: u64,
}

impl ConversationWriter<'_> {
    async fn token(&mut self, token: String) {
        self.sequence += 1;
        self.publish(token, false).await;
    }

    async fn terminal(&mut self, token: &str) {
        self.sequence += 1;
        self.publish(token.to_string(), true).await;
    }

    async fn publish(&self, token: String, done: bool) {
        let envelope = TokenEnvelope::new(self.conversation_id, token, self.sequence, done);
        let payload = match envelope.encode() {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                error!(conversation_id = self.conversation_id, error = %err, "failed to encode envelope");
                return;
            }
        };
        if let Err(err) = self.publisher.publish(&self.channel, payload).await {
            error!(
                conversation_id = self.conversation_id,
                sequence = self.sequence,
                error = %err,
                "failed to publish token"
            );
        }
    }
}

/// Generation front-end that relays inference output onto the source.
#[derive(Clone)]
pub struct OriginProxy {
    client: reqwest::Client,
    config: InferenceConfig,
    publisher: Arc<dyn SourcePublisher>,
}

impl fmt::Debug for OriginProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginProxy")
            .field("inference_url", &self.config.url)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

impl OriginProxy {
    /// Builds a proxy publishing through `publisher`.
    pub fn new(config: InferenceConfig, publisher: Arc<dyn SourcePublisher>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            publisher,
        }
    }

    /// Streams one completion into the source; returns once the terminal envelope is out.
    pub async fn generate(&self, conversation_id: &str, message: &str) {
        metrics::gauge!("tokenrelay_origin_active_generations").increment(1.0);
        let mut writer = ConversationWriter {
            publisher: self.publisher.as_ref(),
            conversation_id,
            channel: format!("{}{conversation_id}", self.config.channel_prefix),
            sequence: 0,
        };

        let terminal = self.relay_completion(&mut writer, message).await;
        writer.terminal(terminal).await;
        info!(
            conversation_id,
            final_sequence = writer.sequence,
            terminal,
            "generation finished"
        );
        metrics::gauge!("tokenrelay_origin_active_generations").decrement(1.0);
    }

    async fn relay_completion(&self, writer: &mut ConversationWriter<'_>, message: &str) -> &'static str {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.url.trim_end_matches('/')
        );
        let request = CompletionRequest {
            model: &self.config.model,
            messages: [CompletionMessage {
                role: "user",
                content: message,
            }],
            stream: true,
        };

        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(conversation_id = writer.conversation_id, url = %url, error = %err, "failed to call inference");
                return ERROR_TOKEN;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(
                conversation_id = writer.conversation_id,
                status = status.as_u16(),
                body = %body,
                "inference returned error"
            );
            return ERROR_TOKEN;
        }

        let mut parser = CompletionStreamParser::default();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(conversation_id = writer.conversation_id, error = %err, "inference stream read failed");
                    return ERROR_TOKEN;
                }
            };
            for event in parser.push(&chunk) {
                match event {
                    CompletionEvent::Delta(content) => writer.token(content).await,
                    CompletionEvent::Finished => return DONE_TOKEN,
                }
            }
        }

        for event in parser.finish() {
            match event {
                CompletionEvent::Delta(content) => writer.token(content).await,
                CompletionEvent::Finished => break,
            }
        }
        DONE_TOKEN
    }
}
