//! crates/campus_chat_core/src/messages.rs
//!
//! Sends messages into a room and reads a room's history.

use crate::domain::{ChatMessage, NewChatMessage};
use crate::error::ChatResult;
use crate::ports::ChatStore;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What `send_message` did with the content it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was stored. It reaches the view through the change feed.
    Sent { message_id: Uuid },
    /// The content was blank after trimming; nothing was stored.
    Skipped,
}

#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn ChatStore>,
}

impl MessageService {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// The whole history of the room, oldest first. Not paginated.
    pub async fn list_messages(&self, viewer: Uuid, room_id: Uuid) -> ChatResult<Vec<ChatMessage>> {
        let messages = self.store.list_messages(viewer, room_id).await?;
        debug!(%room_id, count = messages.len(), "Loaded message history");
        Ok(messages)
    }

    pub async fn send_message(&self, room_id: Uuid, sender_id: Uuid, content: &str) -> ChatResult<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(SendOutcome::Skipped);
        }

        let message = self
            .store
            .insert_message(NewChatMessage { room_id, sender_id, content: content.to_string() })
            .await?;
        info!(%room_id, message_id = %message.id, "Message sent");
        Ok(SendOutcome::Sent { message_id: message.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewChatRoom;
    use crate::memory::MemoryChatStore;

    #[tokio::test]
    async fn whitespace_only_content_is_a_no_op() {
        let store = Arc::new(MemoryChatStore::new());
        let service = MessageService::new(store.clone());

        let outcome = service.send_message(Uuid::new_v4(), Uuid::new_v4(), "  ").await.unwrap();

        assert_eq!(outcome, SendOutcome::Skipped);
        assert_eq!(store.store_calls(), 0);
    }

    #[tokio::test]
    async fn sent_message_appears_once_unread() {
        let store = Arc::new(MemoryChatStore::new());
        let service = MessageService::new(store.clone());
        let (student, recruiter) = (Uuid::new_v4(), Uuid::new_v4());
        let room = store
            .insert_room(NewChatRoom { student_id: student, recruiter_id: recruiter, job_id: None })
            .await
            .unwrap();

        service.send_message(room.id, student, "hello").await.unwrap();
        let history = service.list_messages(recruiter, room.id).await.unwrap();

        let hellos: Vec<_> = history.iter().filter(|m| m.content == "hello").collect();
        assert_eq!(hellos.len(), 1);
        assert_eq!(hellos[0].sender_id, student);
        assert!(!hellos[0].is_read);
    }

    #[tokio::test]
    async fn content_is_trimmed_before_storing() {
        let store = Arc::new(MemoryChatStore::new());
        let service = MessageService::new(store.clone());
        let (student, recruiter) = (Uuid::new_v4(), Uuid::new_v4());
        let room = store
            .insert_room(NewChatRoom { student_id: student, recruiter_id: recruiter, job_id: None })
            .await
            .unwrap();

        service.send_message(room.id, recruiter, "  see you at 3 \n").await.unwrap();

        let history = service.list_messages(student, room.id).await.unwrap();
        assert_eq!(history[0].content, "see you at 3");
    }
}
