//! crates/campus_chat_core/src/ports.rs
//!
//! Defines the service contracts (traits) the chat core consumes.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the hosted row store and its realtime change feed.

use crate::domain::{ChatMessage, ChatRoom, NewChatMessage, NewChatRoom};
use async_trait::async_trait;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflicting row: {0}")]
    Conflict(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Row Store Port
//=========================================================================================

/// Row storage for chat rooms and chat messages.
///
/// Implementations enforce row-level access: a room is only visible to its two
/// participants and a message only to the participants of its room. Calls that
/// take a `viewer` fail with `PortError::Unauthorized` when the viewer is not a
/// participant of the room involved.
#[async_trait]
pub trait ChatStore: Send + Sync {
    // --- Rooms ---
    async fn find_rooms(&self, student_id: Uuid, recruiter_id: Uuid) -> PortResult<Vec<ChatRoom>>;

    /// Fails with `PortError::Conflict` when the pair already has a room.
    async fn insert_room(&self, room: NewChatRoom) -> PortResult<ChatRoom>;

    /// All rooms `user_id` takes part in, most recently active first.
    async fn list_rooms(&self, user_id: Uuid) -> PortResult<Vec<ChatRoom>>;

    // --- Messages ---
    /// The full history of a room, oldest first.
    async fn list_messages(&self, viewer: Uuid, room_id: Uuid) -> PortResult<Vec<ChatMessage>>;

    /// Inserts the message and bumps the room's `updated_at` in the same write.
    async fn insert_message(&self, message: NewChatMessage) -> PortResult<ChatMessage>;

    // --- Read state ---
    async fn unread_message_ids(&self, viewer: Uuid, room_id: Uuid) -> PortResult<Vec<Uuid>>;

    /// Flips `is_read` for all given ids in one batched update. Returns the rows changed.
    async fn mark_messages_read(&self, viewer: Uuid, message_ids: &[Uuid]) -> PortResult<u64>;

    async fn count_unread(&self, viewer: Uuid, room_ids: &[Uuid]) -> PortResult<u64>;
}

//=========================================================================================
// Change Feed Port
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    ChatRooms,
    ChatMessages,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::ChatRooms => "chat_rooms",
            Table::ChatMessages => "chat_messages",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat_rooms" => Some(Table::ChatRooms),
            "chat_messages" => Some(Table::ChatMessages),
            _ => None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    /// Parses a trigger operation name (`INSERT`, `UPDATE`, `DELETE`), case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// A changed row, typed by the table it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Row {
    Room(ChatRoom),
    Message(ChatMessage),
}

impl Row {
    /// The room a row belongs to: the room itself, or the message's owning room.
    pub fn room_id(&self) -> Uuid {
        match self {
            Row::Room(room) => room.id,
            Row::Message(message) => message.room_id,
        }
    }
}

/// A row-level change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub new_row: Option<Row>,
    pub old_row: Option<Row>,
}

impl ChangeEvent {
    /// The most recent image of the row (the new one, or the old one for deletes).
    pub fn row(&self) -> Option<&Row> {
        self.new_row.as_ref().or(self.old_row.as_ref())
    }
}

/// Which events a subscriber wants to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub table: Table,
    pub room_id: Option<Uuid>,
    pub kinds: Vec<ChangeKind>,
}

impl ChangeFilter {
    pub fn table(table: Table, kinds: &[ChangeKind]) -> Self {
        Self { table, room_id: None, kinds: kinds.to_vec() }
    }

    pub fn room(table: Table, room_id: Uuid, kinds: &[ChangeKind]) -> Self {
        Self { table, room_id: Some(room_id), kinds: kinds.to_vec() }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.kinds.contains(&event.kind) {
            return false;
        }
        match self.room_id {
            None => true,
            Some(room_id) => event.row().map(Row::room_id) == Some(room_id),
        }
    }
}

/// The event stream of one live subscription. The stream ending means the
/// subscription was lost and must be re-established.
pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

pub struct Subscription {
    pub id: Uuid,
    pub events: ChangeStream,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> PortResult<Subscription>;

    /// Unsubscribing an unknown id is not an error.
    async fn unsubscribe(&self, subscription_id: Uuid) -> PortResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message_event(kind: ChangeKind, room_id: Uuid) -> ChangeEvent {
        ChangeEvent {
            kind,
            table: Table::ChatMessages,
            new_row: Some(Row::Message(ChatMessage {
                id: Uuid::new_v4(),
                room_id,
                sender_id: Uuid::new_v4(),
                content: "hello".to_string(),
                created_at: Utc::now(),
                is_read: false,
            })),
            old_row: None,
        }
    }

    #[test]
    fn filter_matches_table_kind_and_room() {
        let room_id = Uuid::new_v4();
        let filter = ChangeFilter::room(Table::ChatMessages, room_id, &[ChangeKind::Insert]);

        assert!(filter.matches(&message_event(ChangeKind::Insert, room_id)));
        assert!(!filter.matches(&message_event(ChangeKind::Update, room_id)));
        assert!(!filter.matches(&message_event(ChangeKind::Insert, Uuid::new_v4())));

        let rooms_only = ChangeFilter::table(Table::ChatRooms, &ChangeKind::ALL);
        assert!(!rooms_only.matches(&message_event(ChangeKind::Insert, room_id)));
    }

    #[test]
    fn change_kind_parses_trigger_operations() {
        assert_eq!(ChangeKind::parse("INSERT"), Some(ChangeKind::Insert));
        assert_eq!(ChangeKind::parse("update"), Some(ChangeKind::Update));
        assert_eq!(ChangeKind::parse("TRUNCATE"), None);
    }
}
