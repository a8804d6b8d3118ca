//! # Token envelope
//!
//! The unit of transport between the generation origin, the ingest bridge and the
//! delivery engine. Envelopes travel as JSON objects:
//!
//! ```text
//! {"conversation_id":"c1","token":"Hel","sequence":1,"done":false,"timestamp":1700000000000000000}
//! ```
//!
//! Ordering is carried exclusively by `sequence`; `timestamp` is informational.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted conversation identifier.
pub const MAX_CONVERSATION_ID_LEN: usize = 128;

/// One streamed fragment plus its ordering and terminal metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenEnvelope {
    /// Identity grouping every envelope of one generation session.
    pub conversation_id: String,
    /// Content fragment; empty for control-only envelopes.
    #[serde(default)]
    pub token: String,
    /// Strictly increasing per conversation, starting at 1.
    pub sequence: u64,
    /// Terminal marker, carried by the highest sequence of a conversation.
    #[serde(default)]
    pub done: bool,
    /// Producer capture instant in Unix nanoseconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// Reasons a payload could not be turned into a [`TokenEnvelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not a JSON envelope.
    #[error("malformed envelope payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The id is missing or not routable.
    #[error("envelope is missing a valid conversation_id")]
    InvalidConversation,
    /// Sequences start at 1.
    #[error("envelope sequence must start at 1")]
    ZeroSequence,
}

impl TokenEnvelope {
    /// Builds an envelope stamped with the current time.
    pub fn new(
        conversation_id: impl Into<String>,
        token: impl Into<String>,
        sequence: u64,
        done: bool,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            token: token.into(),
            sequence,
            done,
            timestamp: now_nanos(),
        }
    }

    /// Serializes the envelope into its JSON wire form.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses an envelope from its JSON wire form.
    ///
    /// Decoding fails closed: payloads that parse but cannot be routed (empty or
    /// unroutable `conversation_id`) or ordered (`sequence == 0`) are rejected.
    ///
    /// # Errors
    /// Returns [`DecodeError`] for any payload that is not a usable envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if !is_valid_conversation_id(&envelope.conversation_id) {
            return Err(DecodeError::InvalidConversation);
        }
        if envelope.sequence == 0 {
            return Err(DecodeError::ZeroSequence);
        }
        Ok(envelope)
    }

    /// Topic on the fan-out bus that carries this envelope's conversation.
    #[must_use]
    pub fn destination_topic(&self) -> String {
        destination_topic(&self.conversation_id)
    }
}

/// Fan-out bus topic for a conversation: `chat.{conversation_id}.tokens`.
#[must_use]
pub fn destination_topic(conversation_id: &str) -> String {
    format!("chat.{conversation_id}.tokens")
}

/// Conversation ids become a single subject token on the bus, so they are limited to
/// ASCII alphanumerics, `-` and `_`.
#[must_use]
pub fn is_valid_conversation_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= MAX_CONVERSATION_ID_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Current wall-clock time in Unix nanoseconds.
#[must_use]
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
