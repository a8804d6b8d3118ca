use serde::{Deserialize, Serialize};

/// Body of `POST /chat` on both the delivery engine and the origin proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    /// Prompt text; must not be empty.
    pub message: String,
    /// Existing conversation to continue; a fresh id is assigned when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Payload of the `connected` event that opens a chat stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectedEvent {
    /// Conversation the stream belongs to.
    pub conversation_id: String,
}

/// Payload of an `error` event written before a stream closes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamErrorEvent {
    /// Human-readable failure description.
    pub error: String,
}

impl StreamErrorEvent {
    /// Wraps a failure message.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Response of the origin proxy once generation has been scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatAccepted {
    /// Conversation the tokens will be published under.
    pub conversation_id: String,
    /// Always `streaming`.
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_conversation_id_is_optional() {
        let request: ChatRequest = serde_json::from_str(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(request.message, "hello");
        assert!(request.conversation_id.is_none());

        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"message":"hello"}"#);
    }

    #[test]
    fn error_event_serializes_error_field() {
        let json = serde_json::to_string(&StreamErrorEvent::new("timeout waiting for response"))
            .unwrap();
        assert_eq!(json, r#"{"error":"timeout waiting for response"}"#);
    }
}
