//! Read-only query surface for a room: message history with backward
//! cursor pagination, and the membership roster.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{debug_handler, Json, Router};
use serde::{Deserialize, Serialize};

use crate::store::{self, Message, MessageStore, Participant};
use crate::{AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{room_id}/messages", get(history))
        .route("/{room_id}/participants", get(participants))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    pub before: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub room_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsResponse {
    pub room_id: String,
    pub participants: Vec<Participant>,
}

/// The newest page of a room's history, oldest first. `before` (a timestamp
/// cursor) walks further back; `limit` is clamped server-side. Reading an
/// unknown room lazily creates it, same as joining one.
#[debug_handler]
pub(crate) async fn history(
    State(store): State<MessageStore>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryResponse>> {
    store.ensure_conversation(&room_id).await?;

    let limit = store::clamp_limit(query.limit);
    let messages = match query.before {
        Some(before) => store.messages_before(&room_id, before, limit).await?,
        None => store.recent_messages(&room_id, limit).await?,
    };

    Ok(Json(HistoryResponse { room_id, messages }))
}

#[debug_handler]
pub(crate) async fn participants(
    State(store): State<MessageStore>,
    Path(room_id): Path<String>,
) -> AppResult<Json<ParticipantsResponse>> {
    store.ensure_conversation(&room_id).await?;
    let participants = store.participants(&room_id).await?;

    Ok(Json(ParticipantsResponse {
        room_id,
        participants,
    }))
}
