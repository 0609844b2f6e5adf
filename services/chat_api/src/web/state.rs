//! services/chat_api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use campus_chat_core::{
    ChangeFeed, ChatDirectory, ChatServices, ChatStore, MessageService, ReadStateTracker,
    SessionSettings,
};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub services: ChatServices,
}

impl AppState {
    pub fn new(config: Arc<Config>, store: Arc<dyn ChatStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self { config, services: ChatServices::new(store, feed) }
    }

    pub fn directory(&self) -> &ChatDirectory {
        &self.services.directory
    }

    pub fn messages(&self) -> &MessageService {
        &self.services.messages
    }

    pub fn read_state(&self) -> &ReadStateTracker {
        &self.services.read_state
    }

    /// Settings for the per-connection chat sessions.
    pub fn session_settings(&self) -> SessionSettings {
        self.config.session_settings()
    }
}
