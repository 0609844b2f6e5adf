//! services/chat_api/src/adapters/feed.rs
//!
//! The Postgres implementation of the `ChangeFeed` port. Triggers on the chat
//! tables `pg_notify` every row change (see the migrations); a background
//! `PgListener` task decodes those notifications and fans them out through a
//! `FeedHub` to the subscribed chat sessions.
//!
//! Message rows arrive without their `content`, which the listener reads back
//! by id before publishing.

use crate::adapters::db::{MessageRecord, RoomRecord};
use async_trait::async_trait;
use campus_chat_core::ports::{
    ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, PortError, PortResult, Row, Subscription, Table,
};
use campus_chat_core::{BackoffPolicy, FeedHub};
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The notification channel the table triggers publish on.
pub const CHANGE_CHANNEL: &str = "chat_changes";

#[derive(Debug, thiserror::Error)]
pub enum FeedDecodeError {
    #[error("Malformed change payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown table '{0}'")]
    UnknownTable(String),
    #[error("Unknown event type '{0}'")]
    UnknownEvent(String),
}

#[derive(Deserialize)]
struct ChangePayload {
    event_type: String,
    table: String,
    new_row: Option<serde_json::Value>,
    old_row: Option<serde_json::Value>,
}

fn decode_row(table: Table, value: serde_json::Value) -> Result<Row, FeedDecodeError> {
    Ok(match table {
        Table::ChatRooms => Row::Room(serde_json::from_value::<RoomRecord>(value)?.to_domain()),
        Table::ChatMessages => Row::Message(serde_json::from_value::<MessageRecord>(value)?.to_domain()),
    })
}

/// Decodes one `pg_notify` payload into a change event. Message rows decode with
/// empty content.
pub fn decode_notification(payload: &str) -> Result<ChangeEvent, FeedDecodeError> {
    let payload: ChangePayload = serde_json::from_str(payload)?;
    let table = Table::parse(&payload.table).ok_or_else(|| FeedDecodeError::UnknownTable(payload.table.clone()))?;
    let kind = ChangeKind::parse(&payload.event_type)
        .ok_or_else(|| FeedDecodeError::UnknownEvent(payload.event_type.clone()))?;

    let new_row = payload.new_row.map(|value| decode_row(table, value)).transpose()?;
    let old_row = payload.old_row.map(|value| decode_row(table, value)).transpose()?;
    Ok(ChangeEvent { kind, table, new_row, old_row })
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Clone)]
pub struct PgChangeFeed {
    hub: Arc<FeedHub>,
    connected: Arc<AtomicBool>,
}

impl PgChangeFeed {
    /// Starts the background listener and returns the feed together with the
    /// listener's task handle. The listener stops when `shutdown` is cancelled.
    pub fn spawn(pool: PgPool, backoff: BackoffPolicy, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let feed = Self { hub: Arc::new(FeedHub::new()), connected: Arc::new(AtomicBool::new(false)) };
        let task = tokio::spawn(listen(pool, feed.clone(), backoff, shutdown));
        (feed, task)
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            // Subscribers must resubscribe and re-read what they may have missed.
            self.hub.close_all();
        }
    }
}

/// Fills in the content of the new message row. Returns false when the message
/// is already gone.
async fn load_content(pool: &PgPool, event: &mut ChangeEvent) -> Result<bool, sqlx::Error> {
    let Some(Row::Message(message)) = event.new_row.as_mut() else {
        return Ok(true);
    };
    let content: Option<String> = sqlx::query_scalar("SELECT content FROM chat_messages WHERE id = $1")
        .bind(message.id)
        .fetch_optional(pool)
        .await?;
    match content {
        Some(content) => {
            message.content = content;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn connect(pool: &PgPool) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    Ok(listener)
}

async fn listen(pool: PgPool, feed: PgChangeFeed, backoff: BackoffPolicy, shutdown: CancellationToken) {
    let mut attempt = 0u32;
    loop {
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = connect(&pool) => connected,
        };

        match connected {
            Ok(mut listener) => {
                attempt = 0;
                feed.set_connected(true);
                info!("Listening for chat changes on '{}'", CHANGE_CHANNEL);
                loop {
                    let received = tokio::select! {
                        _ = shutdown.cancelled() => {
                            feed.set_connected(false);
                            return;
                        }
                        received = listener.try_recv() => received,
                    };
                    match received {
                        Ok(Some(notification)) => match decode_notification(notification.payload()) {
                            Ok(mut event) => match load_content(&pool, &mut event).await {
                                Ok(true) => {
                                    let delivered = feed.hub.publish(&event);
                                    debug!(table = %event.table, kind = ?event.kind, delivered, "Change published");
                                }
                                Ok(false) => debug!("Dropping change for a deleted message"),
                                Err(e) => warn!("Failed to load message content for a change: {}", e),
                            },
                            Err(e) => warn!("Dropping undecodable change notification: {}", e),
                        },
                        Ok(None) => {
                            warn!("Change-feed connection lost");
                            break;
                        }
                        Err(e) => {
                            error!("Change-feed listener failed: {}", e);
                            break;
                        }
                    }
                }
                feed.set_connected(false);
            }
            Err(e) => error!("Failed to connect the change-feed listener: {}", e),
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("Change-feed listener stopped");
}

//=========================================================================================
// `ChangeFeed` Trait Implementation
//=========================================================================================

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self, filter: ChangeFilter) -> PortResult<Subscription> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("Change feed is not connected".to_string()));
        }
        self.hub.subscribe(filter)
    }

    async fn unsubscribe(&self, subscription_id: Uuid) -> PortResult<()> {
        self.hub.unsubscribe(subscription_id)
    }
}
