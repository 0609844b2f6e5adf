//! services/chat_api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a WebSocket connection.
//! Each connection owns one `ChatSession`; the session's view is pushed to the
//! client on every change and client commands are forwarded to the session.

use crate::{
    error::ApiError,
    web::{
        protocol::{ClientMessage, ServerMessage, ViewSnapshot},
        state::AppState,
    },
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use campus_chat_core::{ChatSession, Identity, SendOutcome, ViewState};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, identity))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, identity: Identity) {
    info!(user_id = %identity.user_id, role = identity.role.as_str(), "New WebSocket connection established");

    // The sender is wrapped in an Arc<Mutex<>> to allow for shared mutable access across tasks.
    let (sender, mut receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(sender));

    // --- 1. Start the Session ---
    let session = ChatSession::start(identity, app_state.services.clone(), app_state.session_settings());
    let forwarder = spawn_view_forwarder(session.watch(), ws_sender.clone());

    // --- 2. Main Message Loop ---
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Some(reply) = handle_text_message(text.as_str(), &session).await {
                    if let Err(e) = send_json(&ws_sender, &reply).await {
                        error!("Failed to send reply: {}", e);
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!("Client sent close message.");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket receive failed: {}", e);
                break;
            }
            None => {
                info!("Client disconnected.");
                break;
            }
        }
    }

    // --- 3. Cleanup ---
    forwarder.abort();
    session.shutdown().await;
    info!(user_id = %identity.user_id, "WebSocket connection closed.");
}

/// Pushes the current view, then every later change, until the socket or the
/// session goes away.
fn spawn_view_forwarder(mut views: watch::Receiver<ViewState>, ws_sender: WsSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = ViewSnapshot::from(&*views.borrow_and_update());
            if let Err(e) = send_json(&ws_sender, &ServerMessage::View(snapshot)).await {
                debug!("View forwarder stopped: {}", e);
                return;
            }
            if views.changed().await.is_err() {
                return;
            }
        }
    })
}

async fn send_json(ws_sender: &WsSender, message: &ServerMessage) -> Result<(), ApiError> {
    let json = serde_json::to_string(message)?;
    ws_sender.lock().await.send(Message::Text(json.into())).await?;
    Ok(())
}

/// Helper function to handle the logic for different `ClientMessage` variants.
/// Returns the direct reply to the client, if the command has one.
async fn handle_text_message(text: &str, session: &ChatSession) -> Option<ServerMessage> {
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            return Some(ServerMessage::Error { message: "Unrecognised message.".to_string() });
        }
    };

    let result = match client_msg {
        ClientMessage::RefreshRooms => session.refresh_rooms().await.map(|_| None),
        ClientMessage::SelectRoom { room_id } => session.select_room(room_id).await.map(|_| None),
        ClientMessage::DismissNotice => session.dismiss_notice().await.map(|_| None),
        ClientMessage::SendMessage { content } => session.send_message(content).await.map(|outcome| {
            Some(match outcome {
                SendOutcome::Sent { message_id } => ServerMessage::MessageSent { message_id },
                SendOutcome::Skipped => ServerMessage::MessageSkipped,
            })
        }),
        ClientMessage::FindOrCreateRoom { other_party_id, job_id } => session
            .find_or_create_room(other_party_id, job_id)
            .await
            .map(|room_id| Some(ServerMessage::RoomResolved { room_id })),
    };

    result.unwrap_or_else(|e| {
        warn!("Client command failed: {}", e);
        Some(ServerMessage::Error { message: e.notice() })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_chat_core::{ChatServices, MemoryChatStore, SessionSettings};
    use uuid::Uuid;

    fn session_for(identity: Identity) -> ChatSession {
        let store = Arc::new(MemoryChatStore::new());
        let services = ChatServices::new(store.clone(), store);
        ChatSession::start(identity, services, SessionSettings::default())
    }

    #[tokio::test]
    async fn malformed_commands_get_an_error_reply() {
        let session = session_for(Identity::student(Uuid::new_v4()));

        let reply = handle_text_message(r#"{"type":"launch_rockets"}"#, &session).await;

        assert!(matches!(reply, Some(ServerMessage::Error { .. })));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn find_or_create_replies_with_the_room() {
        let session = session_for(Identity::student(Uuid::new_v4()));
        let text = format!(r#"{{"type":"find_or_create_room","other_party_id":"{}"}}"#, Uuid::new_v4());

        let reply = handle_text_message(&text, &session).await;

        match reply {
            Some(ServerMessage::RoomResolved { room_id }) => assert_eq!(session.view().current_room_id(), Some(room_id)),
            other => panic!("unexpected reply: {:?}", other),
        }
        session.shutdown().await;
    }

    #[tokio::test]
    async fn blank_messages_are_reported_as_skipped() {
        let session = session_for(Identity::student(Uuid::new_v4()));
        let text = format!(r#"{{"type":"find_or_create_room","other_party_id":"{}"}}"#, Uuid::new_v4());
        handle_text_message(&text, &session).await;

        let reply = handle_text_message(r#"{"type":"send_message","content":"   "}"#, &session).await;

        assert!(matches!(reply, Some(ServerMessage::MessageSkipped)));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn self_chat_is_reported_as_an_error() {
        let me = Uuid::new_v4();
        let session = session_for(Identity::recruiter(me));
        let text = format!(r#"{{"type":"find_or_create_room","other_party_id":"{}"}}"#, me);

        let reply = handle_text_message(&text, &session).await;

        assert!(matches!(reply, Some(ServerMessage::Error { .. })));
        session.shutdown().await;
    }
}
