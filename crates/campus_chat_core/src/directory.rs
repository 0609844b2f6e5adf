//! crates/campus_chat_core/src/directory.rs
//!
//! Resolves the chat room between the current identity and another party,
//! creating it on first contact.

use crate::domain::{ChatRoom, Identity, NewChatRoom, Role};
use crate::error::{ChatError, ChatResult};
use crate::ports::{ChatStore, PortError};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// The outcome of a find-or-create lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomResolution {
    pub room: ChatRoom,
    pub created: bool,
}

#[derive(Clone)]
pub struct ChatDirectory {
    store: Arc<dyn ChatStore>,
}

impl ChatDirectory {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Finds the room between `me` and `other_party_id`, or creates it.
    ///
    /// The student and recruiter slots are filled from `me.role`, so both sides
    /// of a pair always look up the same `(student_id, recruiter_id)` row. When
    /// several rooms match, the oldest one wins. A concurrent insert that loses
    /// the uniqueness race falls back to the lookup.
    pub async fn find_or_create_room(
        &self,
        me: Identity,
        other_party_id: Uuid,
        job_id: Option<Uuid>,
    ) -> ChatResult<RoomResolution> {
        if me.user_id == other_party_id {
            return Err(ChatError::InvalidOperation("You cannot chat with yourself.".to_string()));
        }

        let (student_id, recruiter_id) = match me.role {
            Role::Student => (me.user_id, other_party_id),
            Role::Recruiter => (other_party_id, me.user_id),
        };

        if let Some(room) = self.first_room(student_id, recruiter_id).await? {
            debug!(room_id = %room.id, "Found existing chat room");
            return Ok(RoomResolution { room, created: false });
        }

        let new_room = NewChatRoom { student_id, recruiter_id, job_id };
        match self.store.insert_room(new_room).await {
            Ok(room) => {
                info!(room_id = %room.id, %student_id, %recruiter_id, "Created chat room");
                Ok(RoomResolution { room, created: true })
            }
            Err(PortError::Conflict(reason)) => {
                debug!(%reason, "Room created concurrently, re-reading");
                let room = self.first_room(student_id, recruiter_id).await?.ok_or_else(|| {
                    ChatError::Store(PortError::NotFound(format!(
                        "Room for student {} and recruiter {}",
                        student_id, recruiter_id
                    )))
                })?;
                Ok(RoomResolution { room, created: false })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The rooms `user_id` takes part in, most recently active first.
    pub async fn list_rooms(&self, user_id: Uuid) -> ChatResult<Vec<ChatRoom>> {
        Ok(self.store.list_rooms(user_id).await?)
    }

    async fn first_room(&self, student_id: Uuid, recruiter_id: Uuid) -> ChatResult<Option<ChatRoom>> {
        let rooms = self.store.find_rooms(student_id, recruiter_id).await?;
        Ok(rooms.into_iter().next())
    }
}
