use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::Response,
};
use shared::models::ChatRequest;
use std::sync::Arc;
use tracing::debug;

use crate::{
    app_state::AppState,
    http::{error::AppResult, sse},
};

/// `POST /chat`: submit a prompt and stream the generated tokens back.
///
/// Validation and the bus subscription happen before the response starts; everything
/// after that, forwarding failures included, is reported in-stream.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = payload?;
    let prepared = state.orchestrator.prepare(request).await?;

    let disconnect = state.shutdown.child_token();
    let (mut sink, response) = sse::event_stream(&disconnect)?;
    tokio::spawn(async move {
        let conversation_id = prepared.conversation_id().to_string();
        let reason = prepared.stream(&mut sink, disconnect).await;
        debug!(conversation_id = %conversation_id, ?reason, "chat task finished");
    });

    Ok(response)
}
