use async_trait::async_trait;
use reqwest::StatusCode;
use shared::models::ChatRequest;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Why the generation origin did not accept a prompt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    /// No response from the origin.
    #[error("origin unreachable: {0}")]
    Transport(String),
    /// The origin answered with a status other than 200 or 202.
    #[error("origin error: {0}")]
    Status(u16),
}

/// The service that starts generation for a conversation.
#[async_trait]
pub trait GenerationOrigin: Send + Sync {
    /// Hands the prompt to the origin. Tokens arrive later through the bus.
    async fn submit(&self, conversation_id: &str, message: &str) -> Result<(), ForwardError>;
}

/// Origin reached over HTTP at `POST {base_url}/chat`.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
    chat_url: String,
}

impl HttpOrigin {
    /// # Errors
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            chat_url: format!("{}/chat", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl GenerationOrigin for HttpOrigin {
    async fn submit(&self, conversation_id: &str, message: &str) -> Result<(), ForwardError> {
        let body = ChatRequest {
            message: message.to_string(),
            conversation_id: Some(conversation_id.to_string()),
        };

        let response = self
            .client
            .post(&self.chat_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                error!(url = %self.chat_url, error = %err, "failed to forward to origin");
                ForwardError::Transport(err.to_string())
            })?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "origin returned error");
            return Err(ForwardError::Status(status.as_u16()));
        }

        info!(conversation_id, status = status.as_u16(), "request forwarded to origin");
        Ok(())
    }
}
