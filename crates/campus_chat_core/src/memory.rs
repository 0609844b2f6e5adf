//! crates/campus_chat_core/src/memory.rs
//!
//! An in-process implementation of both the `ChatStore` and `ChangeFeed` ports.
//! Used when no database is configured and by the test suites. It applies the
//! same row-level access and pair uniqueness rules as the Postgres adapter.

use crate::domain::{ChatMessage, ChatRoom, NewChatMessage, NewChatRoom};
use crate::feed::FeedHub;
use crate::ports::{
    ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChatStore, PortError, PortResult, Row,
    Subscription, Table,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    rooms: HashMap<Uuid, ChatRoom>,
    messages: Vec<ChatMessage>,
}

impl Tables {
    fn room_for(&self, viewer: Uuid, room_id: Uuid) -> PortResult<&ChatRoom> {
        let room = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| PortError::NotFound(format!("Room {} not found", room_id)))?;
        if room.has_participant(viewer) {
            Ok(room)
        } else {
            Err(PortError::Unauthorized)
        }
    }

    fn visible_to(&self, viewer: Uuid, message: &ChatMessage) -> bool {
        self.rooms
            .get(&message.room_id)
            .is_some_and(|room| room.has_participant(viewer))
    }
}

/// In-memory row store and change feed.
#[derive(Default)]
pub struct MemoryChatStore {
    tables: RwLock<Tables>,
    feed: FeedHub,
    store_calls: AtomicU64,
    read_update_batches: AtomicU64,
    last_timestamp: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `ChatStore` calls served so far.
    pub fn store_calls(&self) -> u64 {
        self.store_calls.load(Ordering::SeqCst)
    }

    /// Number of batched read updates that changed at least one row.
    pub fn read_update_batches(&self) -> u64 {
        self.read_update_batches.load(Ordering::SeqCst)
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    fn record_call(&self) {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Strictly increasing timestamps, so rapid inserts keep a total order.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self
            .last_timestamp
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut now = Utc::now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    fn publish(&self, kind: ChangeKind, table: Table, new_row: Option<Row>, old_row: Option<Row>) {
        self.feed.publish(&ChangeEvent { kind, table, new_row, old_row });
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn find_rooms(&self, student_id: Uuid, recruiter_id: Uuid) -> PortResult<Vec<ChatRoom>> {
        self.record_call();
        let tables = self.tables.read().await;
        let mut rooms: Vec<ChatRoom> = tables
            .rooms
            .values()
            .filter(|room| room.student_id == student_id && room.recruiter_id == recruiter_id)
            .cloned()
            .collect();
        rooms.sort_by_key(|room| room.created_at);
        Ok(rooms)
    }

    async fn insert_room(&self, room: NewChatRoom) -> PortResult<ChatRoom> {
        self.record_call();
        let mut tables = self.tables.write().await;
        let taken = tables
            .rooms
            .values()
            .any(|r| r.student_id == room.student_id && r.recruiter_id == room.recruiter_id);
        if taken {
            return Err(PortError::Conflict(format!(
                "Room for student {} and recruiter {} already exists",
                room.student_id, room.recruiter_id
            )));
        }

        let now = self.next_timestamp();
        let created = ChatRoom {
            id: Uuid::new_v4(),
            student_id: room.student_id,
            recruiter_id: room.recruiter_id,
            job_id: room.job_id,
            created_at: now,
            updated_at: now,
        };
        tables.rooms.insert(created.id, created.clone());
        drop(tables);

        self.publish(ChangeKind::Insert, Table::ChatRooms, Some(Row::Room(created.clone())), None);
        Ok(created)
    }

    async fn list_rooms(&self, user_id: Uuid) -> PortResult<Vec<ChatRoom>> {
        self.record_call();
        let tables = self.tables.read().await;
        let mut rooms: Vec<ChatRoom> = tables
            .rooms
            .values()
            .filter(|room| room.has_participant(user_id))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        Ok(rooms)
    }

    async fn list_messages(&self, viewer: Uuid, room_id: Uuid) -> PortResult<Vec<ChatMessage>> {
        self.record_call();
        let tables = self.tables.read().await;
        tables.room_for(viewer, room_id)?;
        let mut messages: Vec<ChatMessage> = tables
            .messages
            .iter()
            .filter(|message| message.room_id == room_id)
            .cloned()
            .collect();
        messages.sort_by_key(ChatMessage::delivery_key);
        Ok(messages)
    }

    async fn insert_message(&self, message: NewChatMessage) -> PortResult<ChatMessage> {
        self.record_call();
        let mut tables = self.tables.write().await;
        let before = tables.room_for(message.sender_id, message.room_id)?.clone();

        let now = self.next_timestamp();
        let created = ChatMessage {
            id: Uuid::new_v4(),
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: message.content,
            created_at: now,
            is_read: false,
        };
        tables.messages.push(created.clone());

        let mut after = before.clone();
        after.updated_at = now;
        tables.rooms.insert(after.id, after.clone());
        drop(tables);

        self.publish(ChangeKind::Insert, Table::ChatMessages, Some(Row::Message(created.clone())), None);
        self.publish(ChangeKind::Update, Table::ChatRooms, Some(Row::Room(after)), Some(Row::Room(before)));
        Ok(created)
    }

    async fn unread_message_ids(&self, viewer: Uuid, room_id: Uuid) -> PortResult<Vec<Uuid>> {
        self.record_call();
        let tables = self.tables.read().await;
        tables.room_for(viewer, room_id)?;
        Ok(tables
            .messages
            .iter()
            .filter(|message| message.room_id == room_id && message.is_unread_for(viewer))
            .map(|message| message.id)
            .collect())
    }

    async fn mark_messages_read(&self, viewer: Uuid, message_ids: &[Uuid]) -> PortResult<u64> {
        self.record_call();
        let mut tables = self.tables.write().await;
        let mut changed = Vec::new();
        for index in 0..tables.messages.len() {
            let message = &tables.messages[index];
            if !message_ids.contains(&message.id)
                || !message.is_unread_for(viewer)
                || !tables.visible_to(viewer, message)
            {
                continue;
            }
            let before = message.clone();
            tables.messages[index].is_read = true;
            changed.push((before, tables.messages[index].clone()));
        }
        drop(tables);

        if !changed.is_empty() {
            self.read_update_batches.fetch_add(1, Ordering::SeqCst);
        }
        let count = changed.len() as u64;
        for (before, after) in changed {
            self.publish(ChangeKind::Update, Table::ChatMessages, Some(Row::Message(after)), Some(Row::Message(before)));
        }
        Ok(count)
    }

    async fn count_unread(&self, viewer: Uuid, room_ids: &[Uuid]) -> PortResult<u64> {
        self.record_call();
        let tables = self.tables.read().await;
        let count = tables
            .messages
            .iter()
            .filter(|message| room_ids.contains(&message.room_id))
            .filter(|message| message.is_unread_for(viewer) && tables.visible_to(viewer, message))
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl ChangeFeed for MemoryChatStore {
    async fn subscribe(&self, filter: ChangeFilter) -> PortResult<Subscription> {
        self.feed.subscribe(filter)
    }

    async fn unsubscribe(&self, subscription_id: Uuid) -> PortResult<()> {
        self.feed.unsubscribe(subscription_id)
    }
}
