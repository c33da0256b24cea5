//! Wire protocol for the live connection: tagged JSON envelopes of the form
//! `{"type": "...", "payload": {...}}`. Client frames that fail to parse are
//! dropped by the relay rather than answered with an error, so every type
//! here is strict about its required fields.

use serde::{Deserialize, Serialize};

use crate::store::Message;

/// Envelopes a client may send over the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "join")]
    Join(JoinRequest),
    #[serde(rename = "leave")]
    Leave(LeaveRequest),
    #[serde(rename = "message")]
    Message(SendMessage),
}

/// Envelopes the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "joined")]
    Joined(JoinAck),
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "message")]
    Message(Message),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub identity_id: String,
}

/// The identity on a leave is advisory; the relay trusts the session's own
/// binding instead.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub room_id: String,
    #[serde(default)]
    pub identity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
}

/// Acknowledgement sent back to the session whose join was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub room_id: String,
}

/// Presence notification fanned out to the rest of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    #[serde(rename = "type")]
    pub kind: SystemKind,
    pub room_id: String,
    pub user_id: String,
    pub at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemKind {
    #[serde(rename = "join")]
    Join,
    #[serde(rename = "leave")]
    Leave,
}
