//! crates/campus_chat_core/src/read_state.rs
//!
//! Marks messages read and counts what is still unread.
//!
//! `mark_room_read` is the single operation behind both read triggers (opening a
//! room and receiving a message in the open room). It is idempotent, so firing
//! it from both paths cannot diverge.

use crate::error::ChatResult;
use crate::ports::ChatStore;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct ReadStateTracker {
    store: Arc<dyn ChatStore>,
}

impl ReadStateTracker {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Marks every message in the room that someone else sent as read, in one
    /// batched update. Returns how many rows changed; zero means nothing was sent.
    pub async fn mark_room_read(&self, room_id: Uuid, viewer: Uuid) -> ChatResult<u64> {
        let unread = self.store.unread_message_ids(viewer, room_id).await?;
        if unread.is_empty() {
            return Ok(0);
        }
        let changed = self.store.mark_messages_read(viewer, &unread).await?;
        debug!(%room_id, changed, "Marked messages read");
        Ok(changed)
    }

    /// Unread messages from other senders, summed over `room_ids`.
    pub async fn count_unread(&self, room_ids: &[Uuid], viewer: Uuid) -> ChatResult<u64> {
        if room_ids.is_empty() {
            return Ok(0);
        }
        Ok(self.store.count_unread(viewer, room_ids).await?)
    }

    /// The same predicate as `count_unread`, applied to each room on its own.
    pub async fn count_unread_by_room(&self, room_ids: &[Uuid], viewer: Uuid) -> ChatResult<HashMap<Uuid, u64>> {
        let counts = try_join_all(room_ids.iter().map(|room_id| async move {
            let count = self.count_unread(std::slice::from_ref(room_id), viewer).await?;
            ChatResult::Ok((*room_id, count))
        }))
        .await?;
        Ok(counts.into_iter().collect())
    }
}
