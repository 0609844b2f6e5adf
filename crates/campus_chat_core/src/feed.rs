//! crates/campus_chat_core/src/feed.rs
//!
//! In-process fan-out of change events to filtered subscribers. Both change-feed
//! adapters (in-memory and Postgres) publish into a `FeedHub` and hand out its
//! subscriptions.

use crate::ports::{ChangeEvent, ChangeFilter, PortResult, Subscription};
use futures::channel::mpsc::{self, UnboundedSender};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

struct Subscriber {
    filter: ChangeFilter,
    sender: UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
pub struct FeedHub {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Uuid, Subscriber>> {
        // The registry holds no invariants a panicking holder could break.
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, filter: ChangeFilter) -> PortResult<Subscription> {
        let (sender, receiver) = mpsc::unbounded();
        let id = Uuid::new_v4();
        debug!(subscription_id = %id, table = %filter.table, room_id = ?filter.room_id, "Registering feed subscriber");
        self.registry().insert(id, Subscriber { filter, sender });
        Ok(Subscription { id, events: Box::pin(receiver) })
    }

    /// Dropping the sender ends the subscriber's stream.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> PortResult<()> {
        if self.registry().remove(&subscription_id).is_some() {
            debug!(subscription_id = %subscription_id, "Removed feed subscriber");
        }
        Ok(())
    }

    /// Delivers `event` to every matching subscriber and returns how many received it.
    /// Subscribers whose stream has been dropped are pruned on the way.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut registry = self.registry();
        let mut delivered = 0;
        registry.retain(|_, subscriber| {
            if subscriber.sender.is_closed() {
                return false;
            }
            if subscriber.filter.matches(event) {
                if subscriber.sender.unbounded_send(event.clone()).is_err() {
                    return false;
                }
                delivered += 1;
            }
            true
        });
        delivered
    }

    /// Ends every live subscription, as a dropped upstream connection would.
    pub fn close_all(&self) {
        let mut registry = self.registry();
        debug!(count = registry.len(), "Closing all feed subscribers");
        registry.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChatRoom;
    use crate::ports::{ChangeKind, Row, Table};
    use chrono::Utc;
    use futures::StreamExt;

    fn room_event() -> ChangeEvent {
        let now = Utc::now();
        ChangeEvent {
            kind: ChangeKind::Insert,
            table: Table::ChatRooms,
            new_row: Some(Row::Room(ChatRoom {
                id: Uuid::new_v4(),
                student_id: Uuid::new_v4(),
                recruiter_id: Uuid::new_v4(),
                job_id: None,
                created_at: now,
                updated_at: now,
            })),
            old_row: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_only_matching_subscribers() {
        let hub = FeedHub::new();
        let mut rooms = hub
            .subscribe(ChangeFilter::table(Table::ChatRooms, &ChangeKind::ALL))
            .unwrap();
        let _messages = hub
            .subscribe(ChangeFilter::table(Table::ChatMessages, &ChangeKind::ALL))
            .unwrap();

        let event = room_event();
        assert_eq!(hub.publish(&event), 1);
        assert_eq!(rooms.events.next().await, Some(event));
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_stream() {
        let hub = FeedHub::new();
        let mut sub = hub
            .subscribe(ChangeFilter::table(Table::ChatRooms, &ChangeKind::ALL))
            .unwrap();

        hub.unsubscribe(sub.id).unwrap();
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(sub.events.next().await, None);
    }

    #[test]
    fn dropped_receivers_are_pruned_on_publish() {
        let hub = FeedHub::new();
        let sub = hub
            .subscribe(ChangeFilter::table(Table::ChatRooms, &ChangeKind::ALL))
            .unwrap();
        drop(sub);

        assert_eq!(hub.publish(&room_event()), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
