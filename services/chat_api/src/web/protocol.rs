//! services/chat_api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between the browser client and the API
//! server, plus the JSON shapes shared with the REST endpoints.

use campus_chat_core::{ChatMessage, ChatRoom, NoticeLevel, SubscriptionState, ViewState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// Shared Payload Shapes
//=========================================================================================

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct RoomDto {
    pub id: Uuid,
    pub student_id: Uuid,
    pub recruiter_id: Uuid,
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ChatRoom> for RoomDto {
    fn from(room: &ChatRoom) -> Self {
        Self {
            id: room.id,
            student_id: room.student_id,
            recruiter_id: room.recruiter_id,
            job_id: room.job_id,
            created_at: room.created_at,
            updated_at: room.updated_at,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct MessageDto {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

impl From<&ChatMessage> for MessageDto {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id,
            room_id: message.room_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            created_at: message.created_at,
            is_read: message.is_read,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NoticeDto {
    /// `info` or `error`.
    pub level: &'static str,
    pub message: String,
}

/// Everything the chat UI renders from.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ViewSnapshot {
    pub rooms: Vec<RoomDto>,
    pub current_room_id: Option<Uuid>,
    pub messages: Vec<MessageDto>,
    pub unread_count: u64,
    pub room_unread: HashMap<Uuid, u64>,
    pub loading_rooms: bool,
    pub loading_messages: bool,
    /// False while any needed change-feed subscription is being (re)established.
    pub live: bool,
    pub notice: Option<NoticeDto>,
}

impl From<&ViewState> for ViewSnapshot {
    fn from(view: &ViewState) -> Self {
        let subscriptions = view.subscriptions;
        let messages_live = view.current_room.is_none() || subscriptions.messages == SubscriptionState::Active;
        Self {
            rooms: view.chat_rooms.iter().map(RoomDto::from).collect(),
            current_room_id: view.current_room_id(),
            messages: view.messages.iter().map(MessageDto::from).collect(),
            unread_count: view.unread_count,
            room_unread: view.room_unread.clone(),
            loading_rooms: view.loading_rooms,
            loading_messages: view.loading_messages,
            live: subscriptions.rooms == SubscriptionState::Active
                && subscriptions.unread == SubscriptionState::Active
                && messages_live,
            notice: view.notice.as_ref().map(|notice| NoticeDto {
                level: match notice.level {
                    NoticeLevel::Info => "info",
                    NoticeLevel::Error => "error",
                },
                message: notice.message.clone(),
            }),
        }
    }
}

//=========================================================================================
// Messages Sent FROM the Client (Browser) TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Re-reads the room list.
    RefreshRooms,

    /// Opens a room, or closes the current one with `null`.
    SelectRoom { room_id: Option<Uuid> },

    /// Sends into the currently open room.
    SendMessage { content: String },

    /// Opens the conversation with another party, creating it on first contact.
    FindOrCreateRoom {
        other_party_id: Uuid,
        #[serde(default)]
        job_id: Option<Uuid>,
    },

    DismissNotice,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client (Browser)
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A full view snapshot, pushed whenever the view changes.
    View(ViewSnapshot),

    /// The room a `find_or_create_room` request resolved to.
    RoomResolved { room_id: Uuid },

    /// The message was accepted; it appears in a later `view` once delivered.
    MessageSent { message_id: Uuid },

    /// The message was blank and nothing was sent.
    MessageSkipped,

    /// Reports an error to the client, which should display an error message.
    Error { message: String },
}
