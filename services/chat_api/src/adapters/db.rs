//! services/chat_api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `ChatStore` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use campus_chat_core::domain::{ChatMessage, ChatRoom, NewChatMessage, NewChatRoom};
use campus_chat_core::ports::{ChatStore, PortError, PortResult};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `ChatStore` port.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    /// Creates a new `PgChatStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Row-level access for a room: it must exist and `viewer` must take part in it.
    async fn ensure_participant(&self, viewer: Uuid, room_id: Uuid) -> PortResult<()> {
        let participants = sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT student_id, recruiter_id FROM chat_rooms WHERE id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_error)?;
        check_participant(participants, viewer, room_id)
    }
}

fn check_participant(participants: Option<(Uuid, Uuid)>, viewer: Uuid, room_id: Uuid) -> PortResult<()> {
    match participants {
        None => Err(PortError::NotFound(format!("Room {} not found", room_id))),
        Some((student_id, recruiter_id)) if viewer == student_id || viewer == recruiter_id => Ok(()),
        Some(_) => Err(PortError::Unauthorized),
    }
}

/// Maps `sqlx` errors onto the port's error vocabulary.
fn port_error(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::RowNotFound => PortError::NotFound("Row not found".to_string()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            PortError::Conflict(db.message().to_string())
        }
        other => PortError::Unexpected(other.to_string()),
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================
// The same records decode change-feed payloads, which carry rows as JSON.

#[derive(FromRow, Deserialize)]
pub(crate) struct RoomRecord {
    id: Uuid,
    student_id: Uuid,
    recruiter_id: Uuid,
    job_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl RoomRecord {
    pub(crate) fn to_domain(self) -> ChatRoom {
        ChatRoom {
            id: self.id,
            student_id: self.student_id,
            recruiter_id: self.recruiter_id,
            job_id: self.job_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow, Deserialize)]
pub(crate) struct MessageRecord {
    id: Uuid,
    room_id: Uuid,
    sender_id: Uuid,
    /// Absent from change notifications; filled in by the change feed.
    #[serde(default)]
    content: String,
    created_at: DateTime<Utc>,
    is_read: bool,
}
impl MessageRecord {
    pub(crate) fn to_domain(self) -> ChatMessage {
        ChatMessage {
            id: self.id,
            room_id: self.room_id,
            sender_id: self.sender_id,
            content: self.content,
            created_at: self.created_at,
            is_read: self.is_read,
        }
    }
}

const ROOM_COLUMNS: &str = "id, student_id, recruiter_id, job_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, content, created_at, is_read";

//=========================================================================================
// `ChatStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl ChatStore for PgChatStore {
    async fn find_rooms(&self, student_id: Uuid, recruiter_id: Uuid) -> PortResult<Vec<ChatRoom>> {
        let records = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE student_id = $1 AND recruiter_id = $2 ORDER BY created_at ASC"
        ))
        .bind(student_id)
        .bind(recruiter_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn insert_room(&self, room: NewChatRoom) -> PortResult<ChatRoom> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "INSERT INTO chat_rooms (student_id, recruiter_id, job_id) VALUES ($1, $2, $3) RETURNING {ROOM_COLUMNS}"
        ))
        .bind(room.student_id)
        .bind(room.recruiter_id)
        .bind(room.job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(record.to_domain())
    }

    async fn list_rooms(&self, user_id: Uuid) -> PortResult<Vec<ChatRoom>> {
        let records = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE $1 IN (student_id, recruiter_id) ORDER BY updated_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn list_messages(&self, viewer: Uuid, room_id: Uuid) -> PortResult<Vec<ChatMessage>> {
        self.ensure_participant(viewer, room_id).await?;

        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE room_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn insert_message(&self, message: NewChatMessage) -> PortResult<ChatMessage> {
        let mut tx = self.pool.begin().await.map_err(port_error)?;

        let participants = sqlx::query_as::<_, (Uuid, Uuid)>(
            "SELECT student_id, recruiter_id FROM chat_rooms WHERE id = $1 FOR UPDATE",
        )
        .bind(message.room_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(port_error)?;
        check_participant(participants, message.sender_id, message.room_id)?;

        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "INSERT INTO chat_messages (room_id, sender_id, content) VALUES ($1, $2, $3) RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message.room_id)
        .bind(message.sender_id)
        .bind(&message.content)
        .fetch_one(&mut *tx)
        .await
        .map_err(port_error)?;

        sqlx::query("UPDATE chat_rooms SET updated_at = $2 WHERE id = $1")
            .bind(message.room_id)
            .bind(record.created_at)
            .execute(&mut *tx)
            .await
            .map_err(port_error)?;

        tx.commit().await.map_err(port_error)?;
        Ok(record.to_domain())
    }

    async fn unread_message_ids(&self, viewer: Uuid, room_id: Uuid) -> PortResult<Vec<Uuid>> {
        self.ensure_participant(viewer, room_id).await?;

        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM chat_messages WHERE room_id = $1 AND NOT is_read AND sender_id <> $2",
        )
        .bind(room_id)
        .bind(viewer)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)
    }

    async fn mark_messages_read(&self, viewer: Uuid, message_ids: &[Uuid]) -> PortResult<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE chat_messages AS m SET is_read = true \
             FROM chat_rooms AS r \
             WHERE r.id = m.room_id AND m.id = ANY($1) AND NOT m.is_read \
               AND m.sender_id <> $2 AND $2 IN (r.student_id, r.recruiter_id)",
        )
        .bind(message_ids)
        .bind(viewer)
        .execute(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(result.rows_affected())
    }

    async fn count_unread(&self, viewer: Uuid, room_ids: &[Uuid]) -> PortResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM chat_messages AS m \
             JOIN chat_rooms AS r ON r.id = m.room_id \
             WHERE m.room_id = ANY($1) AND NOT m.is_read \
               AND m.sender_id <> $2 AND $2 IN (r.student_id, r.recruiter_id)",
        )
        .bind(room_ids)
        .bind(viewer)
        .fetch_one(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_check_distinguishes_missing_and_foreign_rooms() {
        let (student, recruiter, room) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert!(check_participant(Some((student, recruiter)), recruiter, room).is_ok());
        assert_eq!(
            check_participant(Some((student, recruiter)), Uuid::new_v4(), room),
            Err(PortError::Unauthorized)
        );
        assert!(matches!(check_participant(None, student, room), Err(PortError::NotFound(_))));
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(port_error(sqlx::Error::RowNotFound), PortError::NotFound(_)));
        assert!(matches!(port_error(sqlx::Error::PoolTimedOut), PortError::Unexpected(_)));
    }
}
