//! crates/campus_chat_core/src/view.rs
//!
//! The client-local projection of store data that the UI renders from.
//! Only the session actor mutates it; everyone else reads snapshots.

use crate::domain::{ChatMessage, ChatRoom};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle of one change-feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Idle,
    Subscribing,
    Active,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionStates {
    pub rooms: SubscriptionState,
    pub messages: SubscriptionState,
    pub unread: SubscriptionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A transient user-facing notice (the "toast").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    /// Rooms the identity takes part in, most recently active first.
    pub chat_rooms: Vec<ChatRoom>,
    pub current_room: Option<ChatRoom>,
    /// Messages of `current_room`, oldest first.
    pub messages: Vec<ChatMessage>,
    pub unread_count: u64,
    pub room_unread: HashMap<Uuid, u64>,
    pub loading_rooms: bool,
    pub loading_messages: bool,
    pub subscriptions: SubscriptionStates,
    pub notice: Option<Notice>,
}

impl ViewState {
    pub fn current_room_id(&self) -> Option<Uuid> {
        self.current_room.as_ref().map(|room| room.id)
    }

    pub fn room(&self, room_id: Uuid) -> Option<&ChatRoom> {
        self.chat_rooms.iter().find(|room| room.id == room_id)
    }

    /// Inserts at the position given by `(created_at, id)`, ignoring duplicates.
    /// Returns false when the message was already present.
    pub fn insert_message(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let key = message.delivery_key();
        let at = self.messages.partition_point(|m| m.delivery_key() <= key);
        self.messages.insert(at, message);
        true
    }

    /// Replaces a message already in view (e.g. after its read flag flipped).
    /// `is_read` never goes back to false.
    pub fn patch_message(&mut self, message: ChatMessage) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                let is_read = existing.is_read || message.is_read;
                *existing = message;
                existing.is_read = is_read;
                true
            }
            None => false,
        }
    }

    /// Unions a fetched history with whatever arrived through the feed while the
    /// fetch was in flight. For messages in both, the fetched copy is kept but a
    /// read flag seen on either side survives.
    pub fn merge_history(&mut self, history: Vec<ChatMessage>) {
        let arrived = std::mem::replace(&mut self.messages, history);
        self.messages.sort_by_key(ChatMessage::delivery_key);
        for message in arrived {
            if !self.insert_message(message.clone()) {
                self.patch_message(message);
            }
        }
    }

    /// Puts a room at the front unless it is already listed.
    pub fn prepend_room(&mut self, room: ChatRoom) {
        if self.room(room.id).is_none() {
            self.chat_rooms.insert(0, room);
        }
    }

    pub fn set_notice(&mut self, level: NoticeLevel, message: impl Into<String>) {
        self.notice = Some(Notice { level, message: message.into() });
    }
}
