//! services/chat_api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.
//!
//! These endpoints are stateless: they call the chat services directly and do
//! not touch any live session's view state. Live clients use the WebSocket.

use crate::web::{
    protocol::{MessageDto, RoomDto},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use campus_chat_core::{error::with_deadline, ChatError, Identity, PortError, SendOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        list_rooms_handler,
        find_or_create_room_handler,
        list_messages_handler,
        send_message_handler,
        mark_read_handler,
        unread_handler,
    ),
    components(
        schemas(
            RoomDto,
            MessageDto,
            FindOrCreateRoomRequest,
            RoomResolvedResponse,
            SendMessageRequest,
            SendMessageResponse,
            MarkReadResponse,
            RoomUnread,
            UnreadResponse,
        )
    ),
    tags(
        (name = "Campus Chat API", description = "Direct messages between students and recruiters.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct FindOrCreateRoomRequest {
    pub other_party_id: Uuid,
    #[serde(default)]
    pub job_id: Option<Uuid>,
}

#[derive(Serialize, ToSchema)]
pub struct RoomResolvedResponse {
    pub room: RoomDto,
    pub created: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Serialize, ToSchema)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
}

#[derive(Serialize, ToSchema)]
pub struct MarkReadResponse {
    pub marked: u64,
}

#[derive(Serialize, ToSchema)]
pub struct RoomUnread {
    pub room_id: Uuid,
    pub unread: u64,
}

#[derive(Serialize, ToSchema)]
pub struct UnreadResponse {
    pub total: u64,
    pub by_room: Vec<RoomUnread>,
}

type HandlerError = (StatusCode, String);

/// Maps a chat error onto a status code and a user-facing message.
fn chat_error(action: &str, e: ChatError) -> HandlerError {
    let status = match &e {
        ChatError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
        ChatError::Store(PortError::Unauthorized) => StatusCode::FORBIDDEN,
        ChatError::Store(PortError::NotFound(_)) => StatusCode::NOT_FOUND,
        ChatError::Store(PortError::Conflict(_)) => StatusCode::CONFLICT,
        ChatError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Failed to {}: {:?}", action, e);
    } else {
        warn!("Rejected {}: {}", action, e);
    }
    (status, e.notice())
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// List the caller's chat rooms, most recently active first.
#[utoipa::path(
    get,
    path = "/rooms",
    responses(
        (status = 200, description = "The caller's rooms", body = [RoomDto]),
        (status = 401, description = "Missing or invalid identity"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_rooms_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, HandlerError> {
    let rooms = with_deadline(
        app_state.config.store_timeout,
        app_state.directory().list_rooms(identity.user_id),
    )
    .await
    .map_err(|e| chat_error("list rooms", e))?;

    Ok(Json(rooms.iter().map(RoomDto::from).collect::<Vec<_>>()))
}

/// Find the room with another party, or create it on first contact.
#[utoipa::path(
    post,
    path = "/rooms",
    request_body = FindOrCreateRoomRequest,
    responses(
        (status = 201, description = "Room created", body = RoomResolvedResponse),
        (status = 200, description = "Existing room found", body = RoomResolvedResponse),
        (status = 400, description = "Cannot chat with yourself"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn find_or_create_room_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<FindOrCreateRoomRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let resolution = with_deadline(
        app_state.config.store_timeout,
        app_state
            .directory()
            .find_or_create_room(identity, req.other_party_id, req.job_id),
    )
    .await
    .map_err(|e| chat_error("find or create room", e))?;

    let status = if resolution.created { StatusCode::CREATED } else { StatusCode::OK };
    let response = RoomResolvedResponse {
        room: RoomDto::from(&resolution.room),
        created: resolution.created,
    };
    Ok((status, Json(response)))
}

/// The full message history of a room, oldest first.
#[utoipa::path(
    get,
    path = "/rooms/{room_id}/messages",
    params(("room_id" = Uuid, Path, description = "The room to read.")),
    responses(
        (status = 200, description = "Message history", body = [MessageDto]),
        (status = 403, description = "Not a participant of the room"),
        (status = 404, description = "Room not found")
    )
)]
pub async fn list_messages_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(room_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let messages = with_deadline(
        app_state.config.store_timeout,
        app_state.messages().list_messages(identity.user_id, room_id),
    )
    .await
    .map_err(|e| chat_error("list messages", e))?;

    Ok(Json(messages.iter().map(MessageDto::from).collect::<Vec<_>>()))
}

/// Send a message into a room. Blank content is accepted and ignored.
#[utoipa::path(
    post,
    path = "/rooms/{room_id}/messages",
    params(("room_id" = Uuid, Path, description = "The room to send into.")),
    request_body = SendMessageRequest,
    responses(
        (status = 202, description = "Message stored", body = SendMessageResponse),
        (status = 204, description = "Blank message, nothing sent"),
        (status = 403, description = "Not a participant of the room")
    )
)]
pub async fn send_message_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(room_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response, HandlerError> {
    let outcome = with_deadline(
        app_state.config.store_timeout,
        app_state
            .messages()
            .send_message(room_id, identity.user_id, &req.content),
    )
    .await
    .map_err(|e| chat_error("send message", e))?;

    Ok(match outcome {
        SendOutcome::Sent { message_id } => {
            (StatusCode::ACCEPTED, Json(SendMessageResponse { message_id })).into_response()
        }
        SendOutcome::Skipped => StatusCode::NO_CONTENT.into_response(),
    })
}

/// Mark every message the other participant sent in a room as read.
#[utoipa::path(
    post,
    path = "/rooms/{room_id}/read",
    params(("room_id" = Uuid, Path, description = "The room to mark read.")),
    responses(
        (status = 200, description = "Messages marked read", body = MarkReadResponse),
        (status = 403, description = "Not a participant of the room")
    )
)]
pub async fn mark_read_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(room_id): Path<Uuid>,
) -> Result<impl IntoResponse, HandlerError> {
    let marked = with_deadline(
        app_state.config.store_timeout,
        app_state.read_state().mark_room_read(room_id, identity.user_id),
    )
    .await
    .map_err(|e| chat_error("mark room read", e))?;

    Ok(Json(MarkReadResponse { marked }))
}

/// Unread messages from other participants, in total and per room.
#[utoipa::path(
    get,
    path = "/unread",
    responses(
        (status = 200, description = "Unread counts", body = UnreadResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn unread_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, HandlerError> {
    let viewer = identity.user_id;
    let counts = with_deadline(app_state.config.store_timeout, async {
        let rooms = app_state.directory().list_rooms(viewer).await?;
        let room_ids: Vec<Uuid> = rooms.iter().map(|room| room.id).collect();
        let tracker = app_state.read_state();
        let (total, per_room) = tokio::try_join!(
            tracker.count_unread(&room_ids, viewer),
            tracker.count_unread_by_room(&room_ids, viewer),
        )?;
        let by_room = room_ids
            .iter()
            .map(|room_id| RoomUnread {
                room_id: *room_id,
                unread: per_room.get(room_id).copied().unwrap_or(0),
            })
            .collect();
        Ok(UnreadResponse { total, by_room })
    })
    .await
    .map_err(|e| chat_error("count unread", e))?;

    Ok(Json(counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn chat_errors_map_to_status_codes() {
        let cases = [
            (ChatError::InvalidOperation("nope".into()), StatusCode::BAD_REQUEST),
            (ChatError::Store(PortError::Unauthorized), StatusCode::FORBIDDEN),
            (ChatError::Store(PortError::NotFound("room".into())), StatusCode::NOT_FOUND),
            (ChatError::Timeout(Duration::from_secs(1)), StatusCode::GATEWAY_TIMEOUT),
            (ChatError::Store(PortError::Unexpected("boom".into())), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(chat_error("test", err).0, expected);
        }
    }
}
