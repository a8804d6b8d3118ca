use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    app_state::AppState,
    handlers::{chat::chat, streaming::stream_conversation},
};

pub fn create_stream_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stream/{conversation_id}", get(stream_conversation))
        .route("/chat", post(chat))
}
