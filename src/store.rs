//! Durable side of the relay: an append-only message log per conversation,
//! plus the conversation and participant records that outlive any live
//! connection. Rooms and memberships are created lazily and never deleted.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::now_millis;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// A persisted chat message. The same shape goes over the wire, so the
/// serde names are camelCase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub joined_at: i64,
}

/// Activity line for one room in an identity's room listing.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RoomSummary {
    pub room_id: String,
    pub last_message_at: Option<i64>,
    pub message_count: i64,
}

/// Open the pool the way the relay wants it: WAL journaling and
/// create-on-first-run.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await
}

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS participants (
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (conversation_id, user_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_room_created
             ON messages (conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the room's existence. Idempotent: a second call leaves the
    /// stored creation timestamp alone.
    pub async fn ensure_conversation(&self, room_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR IGNORE INTO conversations (id, created_at) VALUES (?, ?)")
            .bind(room_id)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record that an identity has joined a room at least once. Idempotent:
    /// only the earliest joined-at survives repeated joins.
    pub async fn ensure_participant(&self, room_id: &str, user_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO participants (conversation_id, user_id, joined_at)
             VALUES (?, ?, ?)",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a message with a server-assigned id and timestamp and return
    /// the stored row. UUID v7 ids ascend with time, so id order breaks
    /// timestamp ties.
    pub async fn append(
        &self,
        room_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Message, sqlx::Error> {
        let message = Message {
            id: Uuid::now_v7().to_string(),
            room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            content: content.to_owned(),
            created_at: now_millis(),
        };

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.room_id)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// The newest `limit` messages of a room, presented oldest-first.
    pub async fn recent_messages(
        &self,
        room_id: &str,
        limit: u32,
    ) -> Result<Vec<Message>, sqlx::Error> {
        let mut rows: Vec<Message> = sqlx::query_as(
            "SELECT id, conversation_id AS room_id, sender_id, content, created_at
             FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Backward pagination: the newest `limit` messages strictly older than
    /// `before`, presented oldest-first.
    pub async fn messages_before(
        &self,
        room_id: &str,
        before: i64,
        limit: u32,
    ) -> Result<Vec<Message>, sqlx::Error> {
        let mut rows: Vec<Message> = sqlx::query_as(
            "SELECT id, conversation_id AS room_id, sender_id, content, created_at
             FROM messages
             WHERE conversation_id = ? AND created_at < ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(room_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Everyone who has ever joined the room, earliest join first.
    pub async fn participants(&self, room_id: &str) -> Result<Vec<Participant>, sqlx::Error> {
        sqlx::query_as(
            "SELECT user_id, joined_at
             FROM participants
             WHERE conversation_id = ?
             ORDER BY joined_at ASC, rowid ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Every room the identity has ever joined, most recently active first.
    /// Rooms without messages have no last-message timestamp and sort last
    /// (SQLite puts NULLs last under DESC).
    pub async fn rooms_for_identity(
        &self,
        user_id: &str,
    ) -> Result<Vec<RoomSummary>, sqlx::Error> {
        sqlx::query_as(
            "SELECT c.id AS room_id,
                    MAX(m.created_at) AS last_message_at,
                    COUNT(m.id) AS message_count
             FROM conversations c
             JOIN participants p ON p.conversation_id = c.id
             LEFT JOIN messages m ON m.conversation_id = c.id
             WHERE p.user_id = ?
             GROUP BY c.id
             ORDER BY last_message_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }
}

/// Clamp a client-supplied page size: absent or non-positive falls back to
/// the default, oversized is capped.
pub fn clamp_limit(requested: Option<i64>) -> u32 {
    match requested {
        Some(n) if n > 0 => (n as u64).min(MAX_PAGE_SIZE as u64) as u32,
        _ => DEFAULT_PAGE_SIZE,
    }
}
