pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the handlers to make them easily accessible
// to the binary that builds the web server router.
pub use middleware::require_identity;
pub use rest::{
    find_or_create_room_handler, list_messages_handler, list_rooms_handler, mark_read_handler,
    send_message_handler, unread_handler,
};
pub use ws_handler::ws_handler;
