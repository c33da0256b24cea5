//! backchannel: a room-scoped message relay. Clients join a named room over
//! a WebSocket, exchange short text messages, and get join/leave presence
//! events; messages persist in SQLite and are served back through a small
//! read-only query API.

pub mod config;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod store;
pub mod users;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json, Router,
    extract::FromRef,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;

use crate::config::Config;
use crate::registry::RoomRegistry;
use crate::store::MessageStore;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: MessageStore,
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<Config>,
}

/// Full route table: the live relay socket plus the read-only query API.
pub fn app(state: AppState) -> Router {
    let cors = state.config.cors_layer();

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(relay::relay_ws))
        .nest("/api/rooms", rooms::router())
        .nest("/api/users", users::router())
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

pub type AppResult<T> = Result<T, AppError>;

/// Query-surface error: anything that bubbles out of a handler turns into
/// a 500 with a structured body. The live socket path never uses this;
/// invalid or failed frames there are dropped without a reply.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("request failed: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Milliseconds since the Unix epoch, the timestamp unit for every stored
/// row and broadcast event.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
