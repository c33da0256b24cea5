//! The relay core: one task per live connection, running a select loop over
//! inbound frames and the joined room's broadcast stream.
//!
//! Join, message, and leave all follow the same discipline: validate against
//! the session's current binding, touch the store, then fan out under the
//! room's publish lock so every member observes persistence order. Peers are
//! untrusted, so invalid frames are dropped without a reply.

use std::sync::Arc;

use axum::debug_handler;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::protocol::{
    ClientEvent, JoinAck, JoinRequest, LeaveRequest, SendMessage, ServerEvent, SystemEvent,
    SystemKind,
};
use crate::registry::{RoomChannel, RoomEvent, RoomRegistry, SessionId};
use crate::store::{Message, MessageStore};
use crate::{now_millis, AppState};

#[debug_handler]
pub async fn relay_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(state, socket))
}

/// What a joined session holds: the room, the identity it claimed on join,
/// and the room's live channel.
struct RoomBinding {
    room_id: String,
    identity: String,
    channel: Arc<RoomChannel>,
}

async fn handle_session(state: AppState, socket: WebSocket) {
    let session_id: SessionId = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();

    let mut binding: Option<RoomBinding> = None;
    let mut room_rx: Option<broadcast::Receiver<RoomEvent>> = None;

    tracing::debug!(%session_id, "session opened");

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(event) = serde_json::from_str::<ClientEvent>(&text) else {
                            continue;
                        };
                        match event {
                            ClientEvent::Join(req) => {
                                if let Some(ack) =
                                    accept_join(&state, session_id, &mut binding, &mut room_rx, req).await
                                {
                                    if send_event(&mut sink, &ack).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            ClientEvent::Message(req) => {
                                accept_message(&state, &binding, req).await;
                            }
                            ClientEvent::Leave(req) => {
                                accept_leave(&state.registry, session_id, &mut binding, &mut room_rx, req)
                                    .await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    // binary, ping and pong frames are not part of the protocol
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(%session_id, "socket error: {err}");
                        break;
                    }
                }
            }

            event = room_events(&mut room_rx) => {
                match event {
                    Ok(event) => {
                        if event.exclude == Some(session_id) {
                            continue;
                        }
                        if sink.send(WsMessage::Text(event.payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(%session_id, "dropped {n} room events on a slow session");
                    }
                    Err(RecvError::Closed) => {
                        room_rx = None;
                    }
                }
            }
        }
    }

    // disconnect behaves like an explicit leave
    if let Some(current) = binding.take() {
        depart(&state.registry, session_id, current).await;
    }
    tracing::debug!(%session_id, "session closed");
}

/// Resolves to the next event of the joined room, or never while unjoined.
async fn room_events(
    receiver: &mut Option<broadcast::Receiver<RoomEvent>>,
) -> Result<RoomEvent, RecvError> {
    match receiver {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).map_err(axum::Error::new)?;
    sink.send(WsMessage::Text(payload.into())).await
}

/// Bind the session to a room, record the membership, and tell the rest of
/// the room. Returns the acknowledgement for the joining session, or `None`
/// when the request was dropped.
///
/// A join while already joined is a rejoin: the old registration is dropped
/// without a leave event for the old room.
async fn accept_join(
    state: &AppState,
    session_id: SessionId,
    binding: &mut Option<RoomBinding>,
    receiver: &mut Option<broadcast::Receiver<RoomEvent>>,
    req: JoinRequest,
) -> Option<ServerEvent> {
    if req.room_id.is_empty() || req.identity_id.is_empty() {
        return None;
    }

    if let Some(old) = binding.take() {
        tracing::debug!(%session_id, from = %old.room_id, to = %req.room_id, "session rejoining");
        receiver.take();
        state.registry.unregister(&old.room_id, session_id).await;
    }

    let (channel, rx) = state.registry.register(&req.room_id, session_id).await;

    let guard = channel.publish_lock().await;
    if let Err(err) = state.store.ensure_conversation(&req.room_id).await {
        tracing::error!("failed to record room {}: {err}", req.room_id);
    }
    if let Err(err) = state
        .store
        .ensure_participant(&req.room_id, &req.identity_id)
        .await
    {
        tracing::error!("failed to record participant {} in {}: {err}", req.identity_id, req.room_id);
    }
    channel.broadcast(
        &ServerEvent::System(SystemEvent {
            kind: SystemKind::Join,
            room_id: req.room_id.clone(),
            user_id: req.identity_id.clone(),
            at: now_millis(),
        }),
        Some(session_id),
    );
    drop(guard);

    *binding = Some(RoomBinding {
        room_id: req.room_id.clone(),
        identity: req.identity_id,
        channel,
    });
    *receiver = Some(rx);

    Some(ServerEvent::Joined(JoinAck {
        room_id: req.room_id,
    }))
}

/// Persist and fan out one message. Drops the frame when the session is not
/// joined, when the claimed room or sender does not match its binding, or
/// when nothing is left after trimming. A message that failed to persist is
/// never fanned out; the sender gets no error event.
async fn accept_message(state: &AppState, binding: &Option<RoomBinding>, req: SendMessage) {
    let Some(binding) = binding else {
        return;
    };
    if req.room_id != binding.room_id || req.sender_id != binding.identity {
        return;
    }
    let Some(content) = normalize_content(&req.content, state.config.max_message_length) else {
        return;
    };

    let _guard = binding.channel.publish_lock().await;
    match persist_message(&state.store, binding, &content).await {
        Ok(message) => {
            binding.channel.broadcast(&ServerEvent::Message(message), None);
        }
        Err(err) => {
            tracing::error!("failed to persist message in {}: {err}", binding.room_id);
        }
    }
}

async fn persist_message(
    store: &MessageStore,
    binding: &RoomBinding,
    content: &str,
) -> Result<Message, sqlx::Error> {
    store.ensure_conversation(&binding.room_id).await?;
    store
        .ensure_participant(&binding.room_id, &binding.identity)
        .await?;
    store.append(&binding.room_id, &binding.identity, content).await
}

/// Explicit leave. The claimed room must match the binding; the identity on
/// the wire is ignored in favor of the one bound at join time.
async fn accept_leave(
    registry: &RoomRegistry,
    session_id: SessionId,
    binding: &mut Option<RoomBinding>,
    receiver: &mut Option<broadcast::Receiver<RoomEvent>>,
    req: LeaveRequest,
) {
    let matches_room = binding.as_ref().is_some_and(|b| b.room_id == req.room_id);
    if !matches_room {
        return;
    }
    if let Some(current) = binding.take() {
        receiver.take();
        depart(registry, session_id, current).await;
    }
}

/// Tell the rest of the room the session is gone, then drop its
/// registration. Shared by explicit leave and disconnect.
async fn depart(registry: &RoomRegistry, session_id: SessionId, binding: RoomBinding) {
    let guard = binding.channel.publish_lock().await;
    binding.channel.broadcast(
        &ServerEvent::System(SystemEvent {
            kind: SystemKind::Leave,
            room_id: binding.room_id.clone(),
            user_id: binding.identity.clone(),
            at: now_millis(),
        }),
        Some(session_id),
    );
    drop(guard);

    registry.unregister(&binding.room_id, session_id).await;
}

/// Trim surrounding whitespace and clip to `max` characters. `None` when
/// nothing is left.
fn normalize_content(raw: &str, max: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_state() -> AppState {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = MessageStore::new(pool);
        store.migrate().await.unwrap();
        AppState {
            store,
            registry: Arc::new(RoomRegistry::default()),
            config: Arc::new(Config::default()),
        }
    }

    async fn join(
        state: &AppState,
        session: SessionId,
        room: &str,
        identity: &str,
    ) -> (
        Option<RoomBinding>,
        Option<broadcast::Receiver<RoomEvent>>,
        Option<ServerEvent>,
    ) {
        let mut binding = None;
        let mut rx = None;
        let ack = accept_join(
            state,
            session,
            &mut binding,
            &mut rx,
            JoinRequest {
                room_id: room.to_owned(),
                identity_id: identity.to_owned(),
            },
        )
        .await;
        (binding, rx, ack)
    }

    fn drain(rx: &mut Option<broadcast::Receiver<RoomEvent>>) {
        if let Some(rx) = rx {
            while rx.try_recv().is_ok() {}
        }
    }

    fn next_event(rx: &mut Option<broadcast::Receiver<RoomEvent>>) -> RoomEvent {
        rx.as_mut().unwrap().try_recv().unwrap()
    }

    #[test]
    fn content_is_trimmed_and_clipped() {
        assert_eq!(normalize_content("  hi  ", 1000), Some("hi".into()));
        assert_eq!(normalize_content(" \n\t ", 1000), None);
        assert_eq!(normalize_content("", 1000), None);

        let long = "x".repeat(1500);
        assert_eq!(normalize_content(&long, 1000).unwrap().chars().count(), 1000);

        // clipping counts characters, not bytes
        let accented = "é".repeat(10);
        assert_eq!(normalize_content(&accented, 4).unwrap(), "éééé");
    }

    #[tokio::test]
    async fn join_requires_room_and_identity() {
        let state = test_state().await;

        let (binding, _, ack) = join(&state, Uuid::new_v4(), "", "u1").await;
        assert!(ack.is_none());
        assert!(binding.is_none());

        let (binding, _, ack) = join(&state, Uuid::new_v4(), "r1", "").await;
        assert!(ack.is_none());
        assert!(binding.is_none());
    }

    #[tokio::test]
    async fn join_acks_the_sender_and_notifies_the_room() {
        let state = test_state().await;
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());

        let (_b1, mut rx1, ack) = join(&state, s1, "r1", "u1").await;
        assert_eq!(
            ack,
            Some(ServerEvent::Joined(JoinAck {
                room_id: "r1".into()
            }))
        );

        let (_b2, _rx2, _) = join(&state, s2, "r1", "u2").await;

        // first event is u1's own join presence, marked for self-exclusion
        let own = next_event(&mut rx1);
        assert_eq!(own.exclude, Some(s1));

        let event = next_event(&mut rx1);
        assert_eq!(event.exclude, Some(s2));
        let ServerEvent::System(system) = serde_json::from_str(&event.payload).unwrap() else {
            panic!("expected a system event");
        };
        assert_eq!(system.kind, SystemKind::Join);
        assert_eq!(system.room_id, "r1");
        assert_eq!(system.user_id, "u2");
    }

    #[tokio::test]
    async fn join_records_the_participant() {
        let state = test_state().await;
        let (_b, _rx, _ack) = join(&state, Uuid::new_v4(), "r1", "u1").await;

        let participants = state.store.participants("r1").await.unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].user_id, "u1");
    }

    #[tokio::test]
    async fn messages_reach_everyone_and_persist() {
        let state = test_state().await;
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let (b1, mut rx1, _) = join(&state, s1, "r1", "u1").await;
        let (_b2, mut rx2, _) = join(&state, s2, "r1", "u2").await;
        drain(&mut rx1);
        drain(&mut rx2);

        accept_message(
            &state,
            &b1,
            SendMessage {
                room_id: "r1".into(),
                sender_id: "u1".into(),
                content: "  hello  ".into(),
            },
        )
        .await;

        for rx in [&mut rx1, &mut rx2] {
            let event = next_event(rx);
            assert_eq!(event.exclude, None, "the sender is included on purpose");
            let ServerEvent::Message(message) = serde_json::from_str(&event.payload).unwrap()
            else {
                panic!("expected a message event");
            };
            assert_eq!(message.content, "hello");
            assert_eq!(message.sender_id, "u1");
            assert_eq!(message.room_id, "r1");
        }

        let history = state.store.recent_messages("r1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hello");
    }

    #[tokio::test]
    async fn spoofed_or_stray_messages_are_dropped() {
        let state = test_state().await;
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let (b1, _rx1, _) = join(&state, s1, "r1", "u1").await;
        let (_b2, mut rx2, _) = join(&state, s2, "r1", "u2").await;
        drain(&mut rx2);

        // sender spoofing another identity
        accept_message(
            &state,
            &b1,
            SendMessage {
                room_id: "r1".into(),
                sender_id: "u2".into(),
                content: "spoof".into(),
            },
        )
        .await;
        // room the session is not bound to
        accept_message(
            &state,
            &b1,
            SendMessage {
                room_id: "r9".into(),
                sender_id: "u1".into(),
                content: "stray".into(),
            },
        )
        .await;
        // whitespace-only content
        accept_message(
            &state,
            &b1,
            SendMessage {
                room_id: "r1".into(),
                sender_id: "u1".into(),
                content: "   ".into(),
            },
        )
        .await;
        // not joined at all
        accept_message(
            &state,
            &None,
            SendMessage {
                room_id: "r1".into(),
                sender_id: "u1".into(),
                content: "ghost".into(),
            },
        )
        .await;

        assert!(rx2.as_mut().unwrap().try_recv().is_err());
        assert!(state.store.recent_messages("r1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn leave_notifies_the_room_once() {
        let state = test_state().await;
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let (_b1, mut rx1, _) = join(&state, s1, "r1", "u1").await;
        let (mut b2, mut rx2, _) = join(&state, s2, "r1", "u2").await;
        drain(&mut rx1);

        accept_leave(
            &state.registry,
            s2,
            &mut b2,
            &mut rx2,
            LeaveRequest {
                room_id: "r1".into(),
                identity_id: None,
            },
        )
        .await;
        assert!(b2.is_none());

        let event = next_event(&mut rx1);
        assert_eq!(event.exclude, Some(s2));
        let ServerEvent::System(system) = serde_json::from_str(&event.payload).unwrap() else {
            panic!("expected a system event");
        };
        assert_eq!(system.kind, SystemKind::Leave);
        assert_eq!(system.user_id, "u2");

        assert!(rx1.as_mut().unwrap().try_recv().is_err(), "exactly one leave event");
    }

    #[tokio::test]
    async fn leave_for_the_wrong_room_is_ignored() {
        let state = test_state().await;
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let (_b1, mut rx1, _) = join(&state, s1, "r1", "u1").await;
        let (mut b2, mut rx2, _) = join(&state, s2, "r1", "u2").await;
        drain(&mut rx1);

        accept_leave(
            &state.registry,
            s2,
            &mut b2,
            &mut rx2,
            LeaveRequest {
                room_id: "other".into(),
                identity_id: None,
            },
        )
        .await;

        assert!(b2.is_some(), "binding survives a mismatched leave");
        assert!(rx1.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn rejoin_switches_rooms_without_a_leave_event() {
        let state = test_state().await;
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let (mut b1, mut rx1, _) = join(&state, s1, "r1", "u1").await;
        let (_b2, mut rx2, _) = join(&state, s2, "r1", "u2").await;
        drain(&mut rx2);

        let ack = accept_join(
            &state,
            s1,
            &mut b1,
            &mut rx1,
            JoinRequest {
                room_id: "r2".into(),
                identity_id: "u1".into(),
            },
        )
        .await;

        assert!(matches!(ack, Some(ServerEvent::Joined(_))));
        assert_eq!(b1.as_ref().unwrap().room_id, "r2");
        // the old room's remaining member hears nothing about it
        assert!(rx2.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_departs_like_a_leave() {
        let state = test_state().await;
        let (s1, s2) = (Uuid::new_v4(), Uuid::new_v4());
        let (_b1, mut rx1, _) = join(&state, s1, "r1", "u1").await;
        let (b2, _rx2, _) = join(&state, s2, "r1", "u2").await;
        drain(&mut rx1);

        depart(&state.registry, s2, b2.unwrap()).await;

        let event = next_event(&mut rx1);
        let ServerEvent::System(system) = serde_json::from_str(&event.payload).unwrap() else {
            panic!("expected a system event");
        };
        assert_eq!(system.kind, SystemKind::Leave);
        assert_eq!(system.user_id, "u2");
    }
}
