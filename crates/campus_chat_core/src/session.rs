//! crates/campus_chat_core/src/session.rs
//!
//! The realtime sync controller. One `ChatSession` exists per signed-in identity.
//! It spawns an actor task that exclusively owns the view state and the three
//! change-feed subscriptions (rooms, current room's messages, unread), and
//! serializes every mutation through its own event loop.
//!
//! Store reads run as tasks in a `JoinSet`. A message history result carries
//! the generation number current at spawn time and is dropped if the user has
//! switched rooms since, so a slow fetch for a room the user already left never
//! overwrites the messages of the room they are looking at. Room list and
//! unread refreshes are coalesced instead: while one is in flight, further
//! requests only schedule a single rerun.

use crate::directory::{ChatDirectory, RoomResolution};
use crate::domain::{ChatMessage, ChatRoom, Identity};
use crate::error::{with_deadline, ChatError, ChatResult};
use crate::messages::{MessageService, SendOutcome};
use crate::ports::{ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChatStore, Row, Subscription, Table};
use crate::read_state::ReadStateTracker;
use crate::view::{NoticeLevel, SubscriptionState, ViewState};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const COMMAND_BUFFER: usize = 64;

//=========================================================================================
// Settings
//=========================================================================================

/// Exponential backoff used to re-establish lost subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// `base * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_millis(500), max: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Deadline for every store call and subscription handshake.
    pub store_timeout: Duration,
    pub reconnect: BackoffPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { store_timeout: Duration::from_secs(10), reconnect: BackoffPolicy::default() }
    }
}

/// The services a session drives, plus the change feed it listens to.
#[derive(Clone)]
pub struct ChatServices {
    pub directory: ChatDirectory,
    pub messages: MessageService,
    pub read_state: ReadStateTracker,
    pub feed: Arc<dyn ChangeFeed>,
}

impl ChatServices {
    pub fn new(store: Arc<dyn ChatStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            directory: ChatDirectory::new(store.clone()),
            messages: MessageService::new(store.clone()),
            read_state: ReadStateTracker::new(store),
            feed,
        }
    }
}

//=========================================================================================
// Public Handle
//=========================================================================================

enum Command {
    RefreshRooms,
    DismissNotice,
    SelectRoom { room_id: Option<Uuid>, reply: oneshot::Sender<ChatResult<()>> },
    SendMessage { content: String, reply: oneshot::Sender<ChatResult<SendOutcome>> },
    FindOrCreateRoom { other_party_id: Uuid, job_id: Option<Uuid>, reply: oneshot::Sender<ChatResult<Uuid>> },
}

/// Handle to a running chat session. Dropping it tears the session down.
pub struct ChatSession {
    identity: Identity,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<ViewState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ChatSession {
    /// Starts the session actor for `identity`. Must be called inside a Tokio runtime.
    pub fn start(identity: Identity, services: ChatServices, settings: SessionSettings) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view_rx) = watch::channel(ViewState::default());
        let shutdown = CancellationToken::new();

        let actor = SessionActor::new(identity, services, settings, view_tx);
        let span = info_span!("chat_session", user_id = %identity.user_id, role = identity.role.as_str());
        let task = tokio::spawn(actor.run(command_rx, shutdown.clone()).instrument(span));

        Self { identity, commands: command_tx, view: view_rx, shutdown, task: Some(task) }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// A snapshot of the current view state.
    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    /// A receiver that is notified on every view change.
    pub fn watch(&self) -> watch::Receiver<ViewState> {
        self.view.clone()
    }

    pub fn list_rooms(&self) -> Vec<ChatRoom> {
        self.view.borrow().chat_rooms.clone()
    }

    pub fn unread_count(&self) -> u64 {
        self.view.borrow().unread_count
    }

    pub async fn refresh_rooms(&self) -> ChatResult<()> {
        self.commands.send(Command::RefreshRooms).await.map_err(|_| ChatError::SessionClosed)
    }

    pub async fn dismiss_notice(&self) -> ChatResult<()> {
        self.commands.send(Command::DismissNotice).await.map_err(|_| ChatError::SessionClosed)
    }

    /// Makes `room_id` the current room (or clears it with `None`). Resolves once
    /// the message subscription is open; the history arrives later in the view.
    pub async fn select_room(&self, room_id: Option<Uuid>) -> ChatResult<()> {
        self.request(|reply| Command::SelectRoom { room_id, reply }).await
    }

    /// Sends into the current room. The message shows up in the view once the
    /// change feed delivers it, not when this call returns.
    pub async fn send_message(&self, content: impl Into<String>) -> ChatResult<SendOutcome> {
        let content = content.into();
        self.request(|reply| Command::SendMessage { content, reply }).await
    }

    pub async fn find_or_create_room(&self, other_party_id: Uuid, job_id: Option<Uuid>) -> ChatResult<Uuid> {
        self.request(|reply| Command::FindOrCreateRoom { other_party_id, job_id, reply }).await
    }

    /// Stops the actor and waits for it to unsubscribe and clear the view.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Chat session task ended abnormally: {:?}", e);
            }
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<ChatResult<T>>) -> Command) -> ChatResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).await.map_err(|_| ChatError::SessionClosed)?;
        response.await.map_err(|_| ChatError::SessionClosed)?
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

//=========================================================================================
// Actor
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Channel {
    Rooms,
    Messages,
    Unread,
}

enum TaskOutput {
    RoomsLoaded { result: ChatResult<Vec<ChatRoom>> },
    MessagesLoaded { generation: u64, room_id: Uuid, result: ChatResult<Vec<ChatMessage>> },
    UnreadCounted { result: ChatResult<(u64, HashMap<Uuid, u64>)> },
    MarkedRead { room_id: Uuid, result: ChatResult<u64> },
    Reconnect { channel: Channel, room_id: Option<Uuid> },
}

/// At most one fetch in flight; requests made meanwhile collapse into one rerun.
#[derive(Debug, Default)]
struct Refresh {
    in_flight: bool,
    dirty: bool,
}

impl Refresh {
    /// Returns true when the caller should start a fetch now.
    fn request(&mut self) -> bool {
        if self.in_flight {
            self.dirty = true;
            false
        } else {
            self.in_flight = true;
            true
        }
    }

    /// Ends the running fetch. Returns true when a rerun was requested meanwhile;
    /// the caller then starts it and the refresh stays in flight.
    fn finish(&mut self) -> bool {
        let rerun = std::mem::take(&mut self.dirty);
        self.in_flight = rerun;
        rerun
    }
}

struct SessionActor {
    identity: Identity,
    services: ChatServices,
    settings: SessionSettings,
    view: ViewState,
    view_tx: watch::Sender<ViewState>,
    tasks: JoinSet<TaskOutput>,
    rooms_sub: Option<Subscription>,
    messages_sub: Option<Subscription>,
    unread_sub: Option<Subscription>,
    attempts: HashMap<Channel, u32>,
    message_generation: u64,
    rooms_refresh: Refresh,
    unread_refresh: Refresh,
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    match subscription {
        Some(subscription) => subscription.events.next().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    fn new(identity: Identity, services: ChatServices, settings: SessionSettings, view_tx: watch::Sender<ViewState>) -> Self {
        Self {
            identity,
            services,
            settings,
            view: ViewState::default(),
            view_tx,
            tasks: JoinSet::new(),
            rooms_sub: None,
            messages_sub: None,
            unread_sub: None,
            attempts: HashMap::new(),
            message_generation: 0,
            rooms_refresh: Refresh::default(),
            unread_refresh: Refresh::default(),
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        info!("Chat session started");
        self.open_channel(Channel::Rooms).await;
        self.open_channel(Channel::Unread).await;
        self.reload_rooms();
        self.publish();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.rooms_sub) => self.on_rooms_event(event),
                event = next_event(&mut self.messages_sub) => self.on_message_event(event),
                event = next_event(&mut self.unread_sub) => self.on_unread_event(event),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(output) => self.on_task_output(output).await,
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => error!("Chat session task panicked: {:?}", e),
                },
            }
            self.publish();
        }

        self.teardown().await;
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view.clone());
    }

    //-------------------------------------------------------------------------------------
    // Commands
    //-------------------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RefreshRooms => self.reload_rooms(),
            Command::DismissNotice => self.view.notice = None,
            Command::SelectRoom { room_id, reply } => {
                let result = self.select_room(room_id).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::SendMessage { content, reply } => {
                let result = self.send_message(&content).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::FindOrCreateRoom { other_party_id, job_id, reply } => {
                let result = self.find_or_create_room(other_party_id, job_id).await;
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    async fn select_room(&mut self, room_id: Option<Uuid>) -> ChatResult<()> {
        let next = match room_id {
            None => None,
            Some(room_id) => match self.view.room(room_id).cloned() {
                Some(room) => Some(room),
                None => match self.lookup_room(room_id).await {
                    Ok(room) => {
                        self.view.prepend_room(room.clone());
                        Some(room)
                    }
                    Err(e) => {
                        self.report("select room", &e);
                        return Err(e);
                    }
                },
            },
        };
        self.enter_room(next).await;
        Ok(())
    }

    /// Finds a room that is not in the loaded list yet, among the rooms this
    /// identity takes part in.
    async fn lookup_room(&mut self, room_id: Uuid) -> ChatResult<ChatRoom> {
        let rooms = with_deadline(
            self.settings.store_timeout,
            self.services.directory.list_rooms(self.identity.user_id),
        )
        .await?;
        rooms
            .into_iter()
            .find(|room| room.id == room_id)
            .ok_or_else(|| ChatError::InvalidOperation("That conversation is not in your list.".to_string()))
    }

    async fn send_message(&mut self, content: &str) -> ChatResult<SendOutcome> {
        if content.trim().is_empty() {
            return Ok(SendOutcome::Skipped);
        }
        let Some(room_id) = self.view.current_room_id() else {
            let err = ChatError::InvalidOperation("Select a conversation first.".to_string());
            self.report("send message", &err);
            return Err(err);
        };

        let limit = self.settings.store_timeout;
        let sender = self.identity.user_id;
        let result = with_deadline(limit, self.services.messages.send_message(room_id, sender, content)).await;
        if let Err(e) = &result {
            self.report("send message", e);
        }
        result
    }

    async fn find_or_create_room(&mut self, other_party_id: Uuid, job_id: Option<Uuid>) -> ChatResult<Uuid> {
        let limit = self.settings.store_timeout;
        let identity = self.identity;
        let resolved = with_deadline(
            limit,
            self.services.directory.find_or_create_room(identity, other_party_id, job_id),
        )
        .await;

        match resolved {
            Ok(RoomResolution { room, created }) => {
                let room_id = room.id;
                if created {
                    info!(%room_id, "Opened new conversation");
                }
                self.view.prepend_room(room.clone());
                self.enter_room(Some(room)).await;
                Ok(room_id)
            }
            Err(e) => {
                self.report("find or create room", &e);
                Err(e)
            }
        }
    }

    /// Switches the current room. Reselecting the same room reloads it.
    async fn enter_room(&mut self, next: Option<ChatRoom>) {
        self.close_channel(Channel::Messages).await;
        self.message_generation += 1;
        self.attempts.remove(&Channel::Messages);
        self.view.messages.clear();
        self.view.loading_messages = false;
        self.view.current_room = next.clone();

        match next {
            Some(room) => {
                debug!(room_id = %room.id, "Entering room");
                // Subscription opens before the fetch; merge_history reconciles the two.
                self.open_channel(Channel::Messages).await;
                self.load_messages(room.id);
            }
            None => self.view.subscriptions.messages = SubscriptionState::Idle,
        }
    }

    //-------------------------------------------------------------------------------------
    // Change-feed events
    //-------------------------------------------------------------------------------------

    fn on_rooms_event(&mut self, event: Option<ChangeEvent>) {
        match event {
            // Any change to one of our rooms re-reads the whole list.
            Some(event) if self.is_own_room_change(&event) => self.refresh_rooms(),
            Some(_) => {}
            None => self.channel_lost(Channel::Rooms),
        }
    }

    fn on_unread_event(&mut self, event: Option<ChangeEvent>) {
        match event {
            Some(event) if self.is_listed_message_change(&event) => self.refresh_unread(),
            Some(_) => {}
            None => self.channel_lost(Channel::Unread),
        }
    }

    /// The feed covers the whole rooms table; only rooms we take part in count.
    fn is_own_room_change(&self, event: &ChangeEvent) -> bool {
        let user_id = self.identity.user_id;
        [&event.new_row, &event.old_row]
            .into_iter()
            .flatten()
            .any(|row| matches!(row, Row::Room(room) if room.has_participant(user_id)))
    }

    /// Messages in rooms outside our list cannot change our unread counts.
    /// New rooms reach the list through the rooms channel first.
    fn is_listed_message_change(&self, event: &ChangeEvent) -> bool {
        event
            .row()
            .is_some_and(|row| self.view.room(row.room_id()).is_some())
    }

    fn on_message_event(&mut self, event: Option<ChangeEvent>) {
        let Some(event) = event else {
            self.channel_lost(Channel::Messages);
            return;
        };
        let Some(Row::Message(message)) = event.new_row else {
            return;
        };
        if self.view.current_room_id() != Some(message.room_id) {
            return;
        }

        match event.kind {
            ChangeKind::Insert => {
                let from_other = message.sender_id != self.identity.user_id;
                let room_id = message.room_id;
                if self.view.insert_message(message) && from_other {
                    self.mark_read(room_id);
                }
            }
            ChangeKind::Update => {
                self.view.patch_message(message);
            }
            ChangeKind::Delete => {}
        }
    }

    //-------------------------------------------------------------------------------------
    // Background store reads
    //-------------------------------------------------------------------------------------

    /// A room list read the UI waits on, shown through `loading_rooms`.
    fn reload_rooms(&mut self) {
        self.view.loading_rooms = true;
        self.refresh_rooms();
    }

    /// A background re-read after a change event.
    fn refresh_rooms(&mut self) {
        if self.rooms_refresh.request() {
            self.spawn_rooms_fetch();
        }
    }

    fn spawn_rooms_fetch(&mut self) {
        let directory = self.services.directory.clone();
        let user_id = self.identity.user_id;
        let limit = self.settings.store_timeout;
        self.tasks.spawn(async move {
            let result = with_deadline(limit, directory.list_rooms(user_id)).await;
            TaskOutput::RoomsLoaded { result }
        });
    }

    fn load_messages(&mut self, room_id: Uuid) {
        let generation = self.message_generation;
        self.view.loading_messages = true;

        let messages = self.services.messages.clone();
        let viewer = self.identity.user_id;
        let limit = self.settings.store_timeout;
        self.tasks.spawn(async move {
            let result = with_deadline(limit, messages.list_messages(viewer, room_id)).await;
            TaskOutput::MessagesLoaded { generation, room_id, result }
        });
    }

    fn refresh_unread(&mut self) {
        if self.unread_refresh.request() {
            self.spawn_unread_count();
        }
    }

    fn spawn_unread_count(&mut self) {
        let tracker = self.services.read_state.clone();
        let viewer = self.identity.user_id;
        let room_ids: Vec<Uuid> = self.view.chat_rooms.iter().map(|room| room.id).collect();
        let limit = self.settings.store_timeout;
        self.tasks.spawn(async move {
            let result = with_deadline(limit, async {
                tokio::try_join!(
                    tracker.count_unread(&room_ids, viewer),
                    tracker.count_unread_by_room(&room_ids, viewer),
                )
            })
            .await;
            TaskOutput::UnreadCounted { result }
        });
    }

    fn mark_read(&mut self, room_id: Uuid) {
        let tracker = self.services.read_state.clone();
        let viewer = self.identity.user_id;
        let limit = self.settings.store_timeout;
        self.tasks.spawn(async move {
            let result = with_deadline(limit, tracker.mark_room_read(room_id, viewer)).await;
            TaskOutput::MarkedRead { room_id, result }
        });
    }

    async fn on_task_output(&mut self, output: TaskOutput) {
        match output {
            TaskOutput::RoomsLoaded { result } => {
                self.view.loading_rooms = false;
                if self.rooms_refresh.finish() {
                    self.spawn_rooms_fetch();
                }
                match result {
                    Ok(rooms) => {
                        if let Some(current) = self.view.current_room_id() {
                            if let Some(fresh) = rooms.iter().find(|room| room.id == current) {
                                self.view.current_room = Some(fresh.clone());
                            }
                        }
                        self.view.chat_rooms = rooms;
                        self.refresh_unread();
                    }
                    Err(e) => self.report("load rooms", &e),
                }
            }
            TaskOutput::MessagesLoaded { generation, room_id, result } => {
                if generation != self.message_generation || self.view.current_room_id() != Some(room_id) {
                    debug!(%room_id, "Discarding message history for a room no longer open");
                    return;
                }
                self.view.loading_messages = false;
                match result {
                    Ok(history) => {
                        self.view.merge_history(history);
                        self.mark_read(room_id);
                    }
                    Err(e) => self.report("load messages", &e),
                }
            }
            TaskOutput::UnreadCounted { result } => {
                if self.unread_refresh.finish() {
                    self.spawn_unread_count();
                }
                match result {
                    Ok((total, per_room)) => {
                        self.view.unread_count = total;
                        self.view.room_unread = per_room;
                    }
                    // Keep the last known counts.
                    Err(e) => warn!("Failed to count unread messages: {}", e),
                }
            }
            TaskOutput::MarkedRead { room_id, result } => match result {
                Ok(0) => {}
                Ok(_) => self.refresh_unread(),
                Err(e) => warn!(%room_id, "Failed to mark messages read: {}", e),
            },
            TaskOutput::Reconnect { channel, room_id } => self.reconnect(channel, room_id).await,
        }
    }

    //-------------------------------------------------------------------------------------
    // Subscriptions
    //-------------------------------------------------------------------------------------

    fn slot(&mut self, channel: Channel) -> &mut Option<Subscription> {
        match channel {
            Channel::Rooms => &mut self.rooms_sub,
            Channel::Messages => &mut self.messages_sub,
            Channel::Unread => &mut self.unread_sub,
        }
    }

    fn set_state(&mut self, channel: Channel, state: SubscriptionState) {
        let subscriptions = &mut self.view.subscriptions;
        match channel {
            Channel::Rooms => subscriptions.rooms = state,
            Channel::Messages => subscriptions.messages = state,
            Channel::Unread => subscriptions.unread = state,
        }
    }

    fn filter_for(&self, channel: Channel) -> Option<ChangeFilter> {
        let live = [ChangeKind::Insert, ChangeKind::Update];
        match channel {
            Channel::Rooms => Some(ChangeFilter::table(Table::ChatRooms, &ChangeKind::ALL)),
            Channel::Unread => Some(ChangeFilter::table(Table::ChatMessages, &live)),
            Channel::Messages => self
                .view
                .current_room_id()
                .map(|room_id| ChangeFilter::room(Table::ChatMessages, room_id, &live)),
        }
    }

    /// Establishes the subscription for `channel`. On failure a reconnect is scheduled.
    async fn open_channel(&mut self, channel: Channel) -> bool {
        let Some(filter) = self.filter_for(channel) else {
            return false;
        };
        self.set_state(channel, SubscriptionState::Subscribing);
        self.publish();

        let limit = self.settings.store_timeout;
        let feed = self.services.feed.clone();
        let subscribed = with_deadline(limit, async move {
            feed.subscribe(filter)
                .await
                .map_err(|e| ChatError::Subscription(e.to_string()))
        })
        .await;

        match subscribed {
            Ok(subscription) => {
                debug!(?channel, subscription_id = %subscription.id, "Subscribed");
                *self.slot(channel) = Some(subscription);
                self.set_state(channel, SubscriptionState::Active);
                self.attempts.remove(&channel);
                true
            }
            Err(e) => {
                self.report("subscribe", &e);
                self.schedule_reconnect(channel);
                false
            }
        }
    }

    async fn close_channel(&mut self, channel: Channel) {
        let Some(subscription) = self.slot(channel).take() else {
            return;
        };
        if let Err(e) = self.services.feed.unsubscribe(subscription.id).await {
            warn!(?channel, "Failed to unsubscribe: {}", e);
        }
        self.set_state(channel, SubscriptionState::Unsubscribed);
    }

    fn channel_lost(&mut self, channel: Channel) {
        warn!(?channel, "Change-feed subscription lost");
        self.slot(channel).take();
        self.set_state(channel, SubscriptionState::Subscribing);
        self.schedule_reconnect(channel);
    }

    fn schedule_reconnect(&mut self, channel: Channel) {
        let attempt = self.attempts.entry(channel).or_insert(0);
        let delay = self.settings.reconnect.delay(*attempt);
        *attempt += 1;
        let room_id = match channel {
            Channel::Messages => self.view.current_room_id(),
            _ => None,
        };
        debug!(?channel, ?delay, "Scheduling resubscribe");
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            TaskOutput::Reconnect { channel, room_id }
        });
    }

    async fn reconnect(&mut self, channel: Channel, room_id: Option<Uuid>) {
        if channel == Channel::Messages && room_id != self.view.current_room_id() {
            return;
        }
        if self.slot(channel).is_some() {
            return;
        }
        if !self.open_channel(channel).await {
            return;
        }
        info!(?channel, "Change-feed subscription restored");
        // Catch up on whatever happened while the channel was down.
        match channel {
            Channel::Rooms => self.reload_rooms(),
            Channel::Unread => self.refresh_unread(),
            Channel::Messages => {
                if let Some(room_id) = room_id {
                    self.message_generation += 1;
                    self.load_messages(room_id);
                }
            }
        }
    }

    //-------------------------------------------------------------------------------------
    // Errors and teardown
    //-------------------------------------------------------------------------------------

    fn report(&mut self, action: &str, err: &ChatError) {
        let level = match err {
            ChatError::InvalidOperation(_) => {
                info!(action, "Rejected: {}", err);
                NoticeLevel::Info
            }
            _ => {
                error!(action, "Chat operation failed: {}", err);
                NoticeLevel::Error
            }
        };
        self.view.set_notice(level, err.notice());
    }

    async fn teardown(&mut self) {
        for channel in [Channel::Messages, Channel::Rooms, Channel::Unread] {
            self.close_channel(channel).await;
        }
        self.tasks.abort_all();
        self.view = ViewState::default();
        self.publish();
        info!("Chat session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewChatMessage, NewChatRoom};
    use crate::memory::MemoryChatStore;
    use crate::ports::PortResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> SessionSettings {
        SessionSettings {
            store_timeout: Duration::from_secs(2),
            reconnect: BackoffPolicy { base: Duration::from_millis(10), max: Duration::from_millis(50) },
        }
    }

    fn start(store: &Arc<MemoryChatStore>, identity: Identity) -> ChatSession {
        ChatSession::start(identity, ChatServices::new(store.clone(), store.clone()), settings())
    }

    async fn wait_until(session: &ChatSession, what: &str, predicate: impl Fn(&ViewState) -> bool) -> ViewState {
        let mut rx = session.watch();
        let waited = tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|view| predicate(view))).await;
        match waited {
            Ok(Ok(view)) => view.clone(),
            _ => panic!("timed out waiting for {what}: {:#?}", session.view()),
        }
    }

    fn subscribed(view: &ViewState) -> bool {
        view.subscriptions.rooms == SubscriptionState::Active
            && view.subscriptions.unread == SubscriptionState::Active
            && !view.loading_rooms
    }

    async fn seed_room(store: &MemoryChatStore, student: Uuid, recruiter: Uuid) -> ChatRoom {
        store
            .insert_room(NewChatRoom { student_id: student, recruiter_id: recruiter, job_id: None })
            .await
            .unwrap()
    }

    async fn seed_message(store: &MemoryChatStore, room_id: Uuid, sender_id: Uuid, content: &str) -> ChatMessage {
        store
            .insert_message(NewChatMessage { room_id, sender_id, content: content.to_string() })
            .await
            .unwrap()
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy { base: Duration::from_millis(100), max: Duration::from_secs(1) };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn room_list_loads_on_start() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::student(Uuid::new_v4());
        seed_room(&store, me.user_id, Uuid::new_v4()).await;
        seed_room(&store, Uuid::new_v4(), Uuid::new_v4()).await;

        let session = start(&store, me);
        let view = wait_until(&session, "rooms", |v| subscribed(v) && v.chat_rooms.len() == 1).await;

        assert!(view.chat_rooms[0].has_participant(me.user_id));
        assert!(view.current_room.is_none());
    }

    #[tokio::test]
    async fn find_or_create_opens_the_room_and_is_stable() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::student(Uuid::new_v4());
        let recruiter = Uuid::new_v4();
        let session = start(&store, me);
        wait_until(&session, "subscriptions", subscribed).await;

        let first = session.find_or_create_room(recruiter, None).await.unwrap();
        let view = session.view();
        assert_eq!(view.current_room_id(), Some(first));
        assert_eq!(view.chat_rooms[0].id, first);
        assert_eq!(view.subscriptions.messages, SubscriptionState::Active);

        let second = session.find_or_create_room(recruiter, None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_rooms(me.user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chatting_with_yourself_is_rejected() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::recruiter(Uuid::new_v4());
        let session = start(&store, me);
        wait_until(&session, "subscriptions", subscribed).await;

        let err = session.find_or_create_room(me.user_id, None).await.unwrap_err();

        assert!(matches!(err, ChatError::InvalidOperation(_)));
        assert!(store.list_rooms(me.user_id).await.unwrap().is_empty());
        assert!(session.view().notice.is_some());
    }

    #[tokio::test]
    async fn own_message_arrives_through_the_feed() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::student(Uuid::new_v4());
        let session = start(&store, me);
        wait_until(&session, "subscriptions", subscribed).await;
        session.find_or_create_room(Uuid::new_v4(), None).await.unwrap();

        let outcome = session.send_message("hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Sent { .. }));

        let view = wait_until(&session, "hello", |v| v.messages.iter().any(|m| m.content == "hello")).await;
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].sender_id, me.user_id);
        assert!(!view.messages[0].is_read);
    }

    #[tokio::test]
    async fn blank_message_is_skipped() {
        let store = Arc::new(MemoryChatStore::new());
        let session = start(&store, Identity::student(Uuid::new_v4()));
        wait_until(&session, "subscriptions", subscribed).await;
        let room_id = session.find_or_create_room(Uuid::new_v4(), None).await.unwrap();

        assert_eq!(session.send_message("  ").await.unwrap(), SendOutcome::Skipped);
        assert!(store.list_messages(session.identity().user_id, room_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sending_without_a_room_is_invalid() {
        let store = Arc::new(MemoryChatStore::new());
        let session = start(&store, Identity::student(Uuid::new_v4()));
        wait_until(&session, "subscriptions", subscribed).await;

        let err = session.send_message("anyone?").await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn opening_a_room_marks_it_read_in_one_batch() {
        let store = Arc::new(MemoryChatStore::new());
        let (me, recruiter) = (Identity::student(Uuid::new_v4()), Uuid::new_v4());
        let room = seed_room(&store, me.user_id, recruiter).await;
        for text in ["one", "two", "three"] {
            seed_message(&store, room.id, recruiter, text).await;
        }

        let session = start(&store, me);
        wait_until(&session, "unread badge", |v| subscribed(v) && v.unread_count == 3).await;
        session.select_room(Some(room.id)).await.unwrap();

        let view = wait_until(&session, "read", |v| {
            v.messages.len() == 3 && v.unread_count == 0 && v.messages.iter().all(|m| m.is_read)
        })
        .await;
        assert_eq!(view.room_unread.get(&room.id), Some(&0));
        assert_eq!(store.read_update_batches(), 1);
        assert_eq!(store.count_unread(me.user_id, &[room.id]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incoming_message_in_open_room_is_marked_read() {
        let store = Arc::new(MemoryChatStore::new());
        let (me, recruiter) = (Identity::student(Uuid::new_v4()), Uuid::new_v4());
        let room = seed_room(&store, me.user_id, recruiter).await;
        let session = start(&store, me);
        wait_until(&session, "rooms", |v| subscribed(v) && v.chat_rooms.len() == 1).await;
        session.select_room(Some(room.id)).await.unwrap();

        seed_message(&store, room.id, recruiter, "are you free friday?").await;

        wait_until(&session, "incoming read", |v| {
            v.messages.len() == 1 && v.messages[0].is_read && v.unread_count == 0
        })
        .await;
    }

    #[tokio::test]
    async fn switching_rooms_keeps_a_single_message_subscription() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::student(Uuid::new_v4());
        let x = seed_room(&store, me.user_id, Uuid::new_v4()).await;
        let y = seed_room(&store, me.user_id, Uuid::new_v4()).await;
        let session = start(&store, me);
        wait_until(&session, "rooms", |v| subscribed(v) && v.chat_rooms.len() == 2).await;

        session.select_room(Some(x.id)).await.unwrap();
        session.select_room(Some(y.id)).await.unwrap();
        assert_eq!(store.feed().subscriber_count(), 3);

        session.select_room(None).await.unwrap();
        assert_eq!(store.feed().subscriber_count(), 2);
        assert_eq!(session.view().subscriptions.messages, SubscriptionState::Idle);
    }

    /// Wraps the memory store with slow room-list reads or slow history reads
    /// for one room.
    struct DelayedStore {
        inner: Arc<MemoryChatStore>,
        rooms_delay: Duration,
        slow_room: Option<Uuid>,
        history_delay: Duration,
        room_lists: AtomicUsize,
    }

    impl DelayedStore {
        fn rooms(inner: Arc<MemoryChatStore>, delay: Duration) -> Self {
            Self { inner, rooms_delay: delay, slow_room: None, history_delay: Duration::ZERO, room_lists: AtomicUsize::new(0) }
        }

        fn history(inner: Arc<MemoryChatStore>, room_id: Uuid, delay: Duration) -> Self {
            Self { inner, rooms_delay: Duration::ZERO, slow_room: Some(room_id), history_delay: delay, room_lists: AtomicUsize::new(0) }
        }

        fn room_lists(&self) -> usize {
            self.room_lists.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatStore for DelayedStore {
        async fn find_rooms(&self, student_id: Uuid, recruiter_id: Uuid) -> PortResult<Vec<ChatRoom>> {
            self.inner.find_rooms(student_id, recruiter_id).await
        }
        async fn insert_room(&self, room: NewChatRoom) -> PortResult<ChatRoom> {
            self.inner.insert_room(room).await
        }
        async fn list_rooms(&self, user_id: Uuid) -> PortResult<Vec<ChatRoom>> {
            self.room_lists.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.rooms_delay).await;
            self.inner.list_rooms(user_id).await
        }
        async fn list_messages(&self, viewer: Uuid, room_id: Uuid) -> PortResult<Vec<ChatMessage>> {
            if self.slow_room == Some(room_id) {
                tokio::time::sleep(self.history_delay).await;
            }
            self.inner.list_messages(viewer, room_id).await
        }
        async fn insert_message(&self, message: NewChatMessage) -> PortResult<ChatMessage> {
            self.inner.insert_message(message).await
        }
        async fn unread_message_ids(&self, viewer: Uuid, room_id: Uuid) -> PortResult<Vec<Uuid>> {
            self.inner.unread_message_ids(viewer, room_id).await
        }
        async fn mark_messages_read(&self, viewer: Uuid, message_ids: &[Uuid]) -> PortResult<u64> {
            self.inner.mark_messages_read(viewer, message_ids).await
        }
        async fn count_unread(&self, viewer: Uuid, room_ids: &[Uuid]) -> PortResult<u64> {
            self.inner.count_unread(viewer, room_ids).await
        }
    }

    #[tokio::test]
    async fn stale_history_for_a_left_room_is_discarded() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::student(Uuid::new_v4());
        let x = seed_room(&store, me.user_id, Uuid::new_v4()).await;
        let y = seed_room(&store, me.user_id, Uuid::new_v4()).await;
        seed_message(&store, x.id, x.recruiter_id, "from x").await;
        seed_message(&store, y.id, y.recruiter_id, "from y").await;

        let delay = Duration::from_millis(200);
        let slow = Arc::new(DelayedStore::history(store.clone(), x.id, delay));
        let session = ChatSession::start(me, ChatServices::new(slow, store.clone()), settings());
        wait_until(&session, "rooms", |v| subscribed(v) && v.chat_rooms.len() == 2).await;

        session.select_room(Some(x.id)).await.unwrap();
        session.select_room(Some(y.id)).await.unwrap();
        wait_until(&session, "y history", |v| !v.loading_messages && !v.messages.is_empty()).await;
        tokio::time::sleep(delay + Duration::from_millis(100)).await;

        let view = session.view();
        assert_eq!(view.current_room_id(), Some(y.id));
        assert_eq!(view.messages.len(), 1);
        assert!(view.messages.iter().all(|m| m.room_id == y.id));
    }

    #[tokio::test]
    async fn unread_counts_follow_both_participants() {
        let store = Arc::new(MemoryChatStore::new());
        let (a, b) = (Identity::student(Uuid::new_v4()), Identity::recruiter(Uuid::new_v4()));
        let session_a = start(&store, a);
        let session_b = start(&store, b);
        wait_until(&session_a, "a ready", subscribed).await;
        wait_until(&session_b, "b ready", subscribed).await;

        let room_id = session_a.find_or_create_room(b.user_id, None).await.unwrap();
        session_a.send_message("Hi").await.unwrap();
        session_a.select_room(None).await.unwrap();

        wait_until(&session_b, "b sees hi", |v| v.unread_count == 1 && v.room_unread.get(&room_id) == Some(&1)).await;
        session_b.select_room(Some(room_id)).await.unwrap();
        wait_until(&session_b, "b read", |v| v.unread_count == 0 && v.messages.len() == 1).await;

        session_b.send_message("Hello back").await.unwrap();
        wait_until(&session_a, "a sees reply", |v| v.unread_count == 1).await;
        assert_eq!(session_b.unread_count(), 0);

        session_a.select_room(Some(room_id)).await.unwrap();
        let view = wait_until(&session_a, "a read", |v| v.unread_count == 0 && v.messages.len() == 2).await;
        let contents: Vec<_> = view.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Hi", "Hello back"]);
    }

    #[tokio::test]
    async fn lost_subscription_reconnects_and_catches_up() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::recruiter(Uuid::new_v4());
        let session = start(&store, me);
        wait_until(&session, "subscriptions", subscribed).await;

        store.feed().close_all();
        seed_room(&store, Uuid::new_v4(), me.user_id).await;

        wait_until(&session, "caught up", |v| subscribed(v) && v.chat_rooms.len() == 1).await;
    }

    /// Sends a message into `room_id` every 40ms until aborted.
    fn spawn_traffic(store: Arc<MemoryChatStore>, room_id: Uuid, sender_id: Uuid) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut n = 0;
            loop {
                n += 1;
                seed_message(&store, room_id, sender_id, &format!("ping {n}")).await;
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
        })
    }

    #[test]
    fn refresh_requests_collapse_into_one_rerun() {
        let mut refresh = Refresh::default();

        assert!(refresh.request());
        assert!(!refresh.request());
        assert!(!refresh.request());

        assert!(refresh.finish());
        assert!(refresh.in_flight);
        assert!(!refresh.finish());
        assert!(!refresh.in_flight);
        assert!(refresh.request());
    }

    #[tokio::test]
    async fn room_list_settles_under_unrelated_traffic() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::student(Uuid::new_v4());
        seed_room(&store, me.user_id, Uuid::new_v4()).await;
        let strangers = seed_room(&store, Uuid::new_v4(), Uuid::new_v4()).await;
        let traffic = spawn_traffic(store.clone(), strangers.id, strangers.recruiter_id);

        let delayed = Arc::new(DelayedStore::rooms(store.clone(), Duration::from_millis(100)));
        let session = ChatSession::start(me, ChatServices::new(delayed.clone(), store.clone()), settings());
        wait_until(&session, "room list", |v| subscribed(v) && v.chat_rooms.len() == 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        traffic.abort();

        assert_eq!(delayed.room_lists(), 1);
        assert_eq!(session.unread_count(), 0);
    }

    #[tokio::test]
    async fn busy_own_room_still_loads_the_list_and_badge() {
        let store = Arc::new(MemoryChatStore::new());
        let (me, recruiter) = (Identity::student(Uuid::new_v4()), Uuid::new_v4());
        let room = seed_room(&store, me.user_id, recruiter).await;
        let traffic = spawn_traffic(store.clone(), room.id, recruiter);

        let delayed = Arc::new(DelayedStore::rooms(store.clone(), Duration::from_millis(100)));
        let session = ChatSession::start(me, ChatServices::new(delayed, store.clone()), settings());
        let view = wait_until(&session, "list and badge", |v| {
            subscribed(v) && v.chat_rooms.len() == 1 && v.unread_count > 0
        })
        .await;
        traffic.abort();

        assert_eq!(view.chat_rooms[0].id, room.id);
    }

    #[tokio::test]
    async fn history_timeout_clears_loading_and_sets_a_notice() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::student(Uuid::new_v4());
        let room = seed_room(&store, me.user_id, Uuid::new_v4()).await;
        let stalled = Arc::new(DelayedStore::history(store.clone(), room.id, Duration::from_secs(60)));
        let settings = SessionSettings { store_timeout: Duration::from_millis(50), ..settings() };
        let session = ChatSession::start(me, ChatServices::new(stalled, store.clone()), settings);
        wait_until(&session, "rooms", |v| subscribed(v) && v.chat_rooms.len() == 1).await;

        session.select_room(Some(room.id)).await.unwrap();

        let view = wait_until(&session, "timeout", |v| v.notice.is_some() && !v.loading_messages).await;
        assert_eq!(view.current_room_id(), Some(room.id));
        assert!(view.messages.is_empty());
        assert_eq!(view.notice.map(|n| n.level), Some(NoticeLevel::Error));
    }

    #[tokio::test]
    async fn selecting_a_room_before_the_list_loads_looks_it_up() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::recruiter(Uuid::new_v4());
        let room = seed_room(&store, Uuid::new_v4(), me.user_id).await;
        let delayed = Arc::new(DelayedStore::rooms(store.clone(), Duration::from_millis(300)));
        let session = ChatSession::start(me, ChatServices::new(delayed, store.clone()), settings());

        session.select_room(Some(room.id)).await.unwrap();
        assert_eq!(session.view().current_room_id(), Some(room.id));

        let err = session.select_room(Some(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidOperation(_)));
        assert_eq!(session.view().notice.map(|n| n.level), Some(NoticeLevel::Info));
    }

    #[tokio::test]
    async fn shutdown_unsubscribes_and_clears_the_view() {
        let store = Arc::new(MemoryChatStore::new());
        let me = Identity::student(Uuid::new_v4());
        let room = seed_room(&store, me.user_id, Uuid::new_v4()).await;
        let session = start(&store, me);
        wait_until(&session, "rooms", |v| subscribed(v) && v.chat_rooms.len() == 1).await;
        session.select_room(Some(room.id)).await.unwrap();
        let watcher = session.watch();

        session.shutdown().await;

        assert_eq!(*watcher.borrow(), ViewState::default());
        assert_eq!(store.feed().subscriber_count(), 0);
    }
}
