//! Live side of the relay: one broadcast channel per room with at least one
//! connected session. Channels are created on first join and collected once
//! the last member leaves; the durable record in the store is untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::protocol::ServerEvent;

pub type SessionId = Uuid;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One fanned-out payload: the JSON text of a server event, plus the session
/// (if any) that must not forward it to its own client.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub exclude: Option<SessionId>,
    pub payload: String,
}

pub struct RoomChannel {
    sender: broadcast::Sender<RoomEvent>,
    members: Mutex<HashSet<SessionId>>,
    publish: Mutex<()>,
}

impl RoomChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: Mutex::new(HashSet::new()),
            publish: Mutex::new(()),
        }
    }

    async fn join(&self, session: SessionId) -> broadcast::Receiver<RoomEvent> {
        self.members.lock().await.insert(session);
        self.sender.subscribe()
    }

    /// Serializes persist-then-broadcast sequences: whoever holds the guard
    /// owns the room's publication order.
    pub async fn publish_lock(&self) -> MutexGuard<'_, ()> {
        self.publish.lock().await
    }

    /// Encode an event once and hand it to every subscribed session.
    /// Returns how many receivers got it.
    pub fn broadcast(&self, event: &ServerEvent, exclude: Option<SessionId>) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!("failed to encode room event: {err}");
                return 0;
            }
        };
        self.sender
            .send(RoomEvent { exclude, payload })
            .unwrap_or(0)
    }
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<RoomChannel>>>,
    capacity: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl RoomRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Attach a session to a room's channel, creating the channel on first
    /// join. The membership insert and the subscription happen under the map
    /// lock so a concurrent [`unregister`](Self::unregister) cannot collect
    /// the room in between.
    pub async fn register(
        &self,
        room_id: &str,
        session: SessionId,
    ) -> (Arc<RoomChannel>, broadcast::Receiver<RoomEvent>) {
        {
            let rooms = self.rooms.read().await;
            if let Some(channel) = rooms.get(room_id) {
                let receiver = channel.join(session).await;
                return (channel.clone(), receiver);
            }
        }

        let mut rooms = self.rooms.write().await;
        let channel = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(RoomChannel::new(self.capacity)))
            .clone();
        let receiver = channel.join(session).await;
        (channel, receiver)
    }

    /// Detach a session; the room's channel is dropped with its last member.
    pub async fn unregister(&self, room_id: &str, session: SessionId) {
        let mut rooms = self.rooms.write().await;
        let Some(channel) = rooms.get(room_id) else {
            return;
        };

        let mut members = channel.members.lock().await;
        members.remove(&session);
        let last_one_out = members.is_empty();
        drop(members);

        if last_one_out {
            rooms.remove(room_id);
            tracing::debug!(room_id, "room channel closed");
        }
    }
}
