use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;

use crate::{
    app_state::AppState,
    delivery::start_sequence_from_last_event_id,
    http::{error::AppResult, sse},
};

const LAST_EVENT_ID: &str = "last-event-id";

/// `GET /stream/{conversation_id}`: resumable token stream for an existing conversation.
///
/// A `Last-Event-ID` of `N` resumes after sequence `N`. The subscription is opened before
/// the response is returned, so a bus failure still surfaces as a 500 problem response.
pub async fn stream_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let last_event_id = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok());
    let start_sequence = start_sequence_from_last_event_id(last_event_id);

    let connection = state.engine.connect(&conversation_id, start_sequence).await?;

    let disconnect = state.shutdown.child_token();
    let (mut sink, response) = sse::event_stream(&disconnect)?;
    let engine = state.engine.clone();
    tokio::spawn(async move {
        let reason = engine.resume(connection, &mut sink, disconnect).await;
        debug!(conversation_id = %conversation_id, ?reason, "stream task finished");
    });

    Ok(response)
}
