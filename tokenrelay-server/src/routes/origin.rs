use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use shared::models::{ChatAccepted, ChatRequest, is_valid_conversation_id};
use uuid::Uuid;

use crate::{
    http::error::{ApiError, AppResult},
    services::OriginProxy,
};

/// `POST /chat` on the origin: schedule generation and answer immediately.
async fn start_generation(
    State(proxy): State<OriginProxy>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("Message is required"));
    }

    let conversation_id = match request.conversation_id {
        Some(id) if is_valid_conversation_id(&id) => id,
        Some(id) => return Err(ApiError::bad_request(format!("invalid conversation id '{id}'"))),
        None => Uuid::new_v4().to_string(),
    };

    let background_id = conversation_id.clone();
    tokio::spawn(async move {
        proxy.generate(&background_id, &request.message).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(ChatAccepted {
            conversation_id,
            status: "streaming".into(),
        }),
    ))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub fn create_origin_router(proxy: OriginProxy) -> Router {
    Router::new()
        .route("/chat", post(start_generation))
        .route("/healthz", get(healthz))
        .with_state(proxy)
}
