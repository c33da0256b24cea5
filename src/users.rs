//! Per-identity room listing: every room an identity has ever joined, with
//! activity summaries and full rosters.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{debug_handler, Json, Router};
use serde::Serialize;

use crate::store::{MessageStore, Participant};
use crate::{AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/{user_id}/rooms", get(rooms_for_user))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoomsResponse {
    pub user_id: String,
    pub rooms: Vec<UserRoom>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoom {
    pub room_id: String,
    pub last_message_at: Option<i64>,
    pub message_count: i64,
    pub participants: Vec<Participant>,
}

/// Rooms ordered by most recent message; rooms that never saw one trail the
/// list. Identities that joined nothing get an empty listing, not an error.
#[debug_handler]
pub(crate) async fn rooms_for_user(
    State(store): State<MessageStore>,
    Path(user_id): Path<String>,
) -> AppResult<Json<UserRoomsResponse>> {
    let summaries = store.rooms_for_identity(&user_id).await?;

    let mut rooms = Vec::with_capacity(summaries.len());
    for summary in summaries {
        let participants = store.participants(&summary.room_id).await?;
        rooms.push(UserRoom {
            room_id: summary.room_id,
            last_message_at: summary.last_message_at,
            message_count: summary.message_count,
            participants,
        });
    }

    Ok(Json(UserRoomsResponse { user_id, rooms }))
}
