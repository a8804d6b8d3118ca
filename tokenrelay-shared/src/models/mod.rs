//! Wire and API models.

/// Chat request and stream event bodies.
pub mod chat;
/// The token envelope and its codec.
pub mod envelope;

pub use chat::{ChatAccepted, ChatRequest, ConnectedEvent, StreamErrorEvent};
pub use envelope::{
    DecodeError, TokenEnvelope, destination_topic, is_valid_conversation_id, now_nanos,
};
