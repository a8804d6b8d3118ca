use axum::{extract::rejection::JsonRejection, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::problem::ProblemDetails;
use crate::{delivery::SubscribeError, services::ChatError};

pub type AppResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let mut problem = ProblemDetails::new(self.status, self.code, self.message);
        if let Some(details) = self.details {
            problem = problem.with_details(details);
        }
        problem.into_response()
    }
}

impl From<http::Error> for ApiError {
    fn from(err: http::Error) -> Self {
        Self::internal_server_error(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("Invalid request body").with_details(json!({ "reason": rejection.body_text() }))
    }
}

impl From<SubscribeError> for ApiError {
    fn from(err: SubscribeError) -> Self {
        match err {
            SubscribeError::InvalidConversation(id) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_conversation", format!("invalid conversation id '{id}'"))
            }
            SubscribeError::Bus(bus) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "subscribe_failed",
                "Failed to subscribe",
            )
            .with_details(json!({ "reason": bus.to_string() })),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::EmptyMessage => {
                Self::new(StatusCode::BAD_REQUEST, "validation_failed", "Message is required")
            }
            ChatError::InvalidConversation(id) => Self::new(
                StatusCode::BAD_REQUEST,
                "invalid_conversation",
                format!("invalid conversation id '{id}'"),
            ),
            ChatError::OriginUnavailable => {
                Self::service_unavailable("no generation origin is configured")
            }
            ChatError::Subscribe(err) => Self::from(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use http::header::CONTENT_TYPE;
    use serde_json::Value;

    #[tokio::test]
    async fn into_response_serializes_problem_details() {
        let response = ApiError::bad_request("missing field")
            .with_details(json!({ "field": "message" }))
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );

        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body to bytes");
        let json: Value =
            serde_json::from_slice(&bytes).expect("problem details deserializes to json");
        assert_eq!(json["code"], "bad_request");
        assert_eq!(json["status"], 400);
        assert_eq!(json["message"], "missing field");
        assert_eq!(json["details"]["field"], "message");
    }

    #[test]
    fn chat_errors_map_to_matching_status_codes() {
        assert_eq!(
            ApiError::from(ChatError::EmptyMessage).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ChatError::InvalidConversation("a.b".into())).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ChatError::OriginUnavailable).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );

        let bus_down = ChatError::Subscribe(SubscribeError::Bus(BusError::Subscribe {
            topic: "chat.c1.tokens".into(),
            reason: "disconnected".into(),
        }));
        assert_eq!(
            ApiError::from(bus_down).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
