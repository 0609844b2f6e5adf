//! crates/campus_chat_core/src/error.rs
//!
//! The error type returned by the chat services and the session controller.

use crate::ports::PortError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// A caller-side precondition was violated; nothing reached the store.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The row store or change feed failed.
    #[error("Store error: {0}")]
    Store(#[from] PortError),

    /// A change-feed subscription could not be established or was lost.
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// A store call did not finish within the configured deadline.
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The session actor is gone (signed out or torn down).
    #[error("Chat session is closed")]
    SessionClosed,
}

/// A convenience type alias for `Result<T, ChatError>`.
pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    /// Short text suitable for a transient user-facing notice.
    pub fn notice(&self) -> String {
        match self {
            ChatError::InvalidOperation(reason) => reason.clone(),
            ChatError::Store(PortError::Unauthorized) => {
                "You do not have access to this conversation.".to_string()
            }
            ChatError::Store(PortError::NotFound(_)) => "Conversation not found.".to_string(),
            ChatError::Store(_) => "Something went wrong, please try again.".to_string(),
            ChatError::Subscription(_) => "Live updates are reconnecting...".to_string(),
            ChatError::Timeout(_) => "The server took too long to respond.".to_string(),
            ChatError::SessionClosed => "Your chat session has ended.".to_string(),
        }
    }
}

/// Runs `future` under `limit`, mapping expiry to `ChatError::Timeout`.
pub async fn with_deadline<T, F>(limit: Duration, future: F) -> ChatResult<T>
where
    F: Future<Output = ChatResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::Timeout(limit)),
    }
}
