//! Read-only transcript of a stored conversation, for pages that resume one.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::state::SessionRegistry;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;

#[derive(Debug, Deserialize, Default)]
pub struct TranscriptQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `GET /conversations/{conversation_id}/messages?limit=N`
///
/// The newest `limit` messages (default 50), oldest first.
pub async fn messages_handler(
    State(registry): State<Arc<SessionRegistry>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> Response {
    if Uuid::parse_str(&conversation_id).is_err() {
        return (StatusCode::BAD_REQUEST, "Invalid conversation_id").into_response();
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    match registry.transcript(&conversation_id, limit).await {
        Ok(Some(messages)) => Json(messages).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Conversation not found").into_response(),
        Err(e) => {
            warn!(
                component = "transcript",
                event = "transcript.load_failed",
                conversation_id = %conversation_id,
                error = %e,
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to load messages").into_response()
        }
    }
}
