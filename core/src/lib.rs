//! RideChat Core Library
//!
//! Realtime chat layer of the carpooling portal: one authenticated
//! STOMP-over-WebSocket session, per-conversation message timelines, the
//! conversation directory and the cross-screen unread badge.

pub mod api;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod event;
pub mod listeners;
pub mod models;
pub mod stomp;
pub mod timeline;
pub mod transport;
pub mod unread;

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use api::{ChatApi, HttpApi};
pub use config::ClientConfig;
pub use credentials::Credentials;
pub use directory::{ConversationDirectory, Foreground};
pub use error::{Error, Result};
pub use event::PushEvent;
pub use listeners::Subscription;
pub use models::*;
pub use timeline::MessageTimeline;
pub use transport::{ConnectionState, Connector, Publisher, Transport, WsConnector};
pub use unread::UnreadAggregator;

type Timelines = Arc<Mutex<HashMap<ConversationKey, MessageTimeline>>>;

/// Main client instance
pub struct ChatClient {
    me: EmpId,
    config: ClientConfig,
    api: Arc<dyn ChatApi>,
    transport: Transport,
    foreground: Foreground,
    directory: Arc<Mutex<ConversationDirectory>>,
    timelines: Timelines,
    aggregator: UnreadAggregator,
    subscriptions: Mutex<Vec<Subscription>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Create a client talking to the configured server over HTTP and WebSocket.
    pub fn new(config: ClientConfig, me: EmpId, credentials: Credentials) -> Result<Self> {
        let api = Arc::new(HttpApi::new(&config, credentials.clone())?);
        let transport = Transport::new(&config, credentials)?;
        Ok(Self::with_parts(config, me, api, transport))
    }

    pub fn with_parts(
        config: ClientConfig,
        me: EmpId,
        api: Arc<dyn ChatApi>,
        transport: Transport,
    ) -> Self {
        let foreground = Foreground::new();
        let aggregator = UnreadAggregator::new(
            me,
            Arc::clone(&api),
            foreground.clone(),
            config.chat.unread_poll_interval(),
        );

        Self {
            me,
            directory: Arc::new(Mutex::new(ConversationDirectory::new(me, foreground.clone()))),
            timelines: Arc::new(Mutex::new(HashMap::new())),
            config,
            api,
            transport,
            foreground,
            aggregator,
            subscriptions: Mutex::new(Vec::new()),
            refresher: Mutex::new(None),
        }
    }

    pub fn me(&self) -> EmpId {
        self.me
    }

    /// Subscribe the timelines, directory and badge to the push stream,
    /// connect, and start the periodic unread poll and directory refresh.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.is_empty() {
                tracing::debug!("start() ignored, chat client already running");
                return;
            }
            subscriptions.push(self.transport.add_listener(timeline_listener(
                self.me,
                Arc::clone(&self.timelines),
                self.foreground.clone(),
                self.transport.publisher(),
            )));
            subscriptions.push(
                self.transport
                    .add_listener(directory_listener(self.me, Arc::clone(&self.directory))),
            );
            subscriptions.push(self.transport.add_listener(self.aggregator.listener()));
        }

        self.transport.connect();
        self.aggregator.start();

        let api = Arc::clone(&self.api);
        let directory = Arc::clone(&self.directory);
        let period = self.config.chat.directory_refresh_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match api.list_conversations().await {
                    Ok(listing) => directory.lock().refresh(listing),
                    Err(e) => tracing::warn!("Conversation refresh failed, keeping stale list: {}", e),
                }
            }
        });
        if let Some(previous) = self.refresher.lock().replace(task) {
            previous.abort();
        }
        tracing::info!("Chat client started for employee {}", self.me);
    }

    /// Cancel timers, drop every subscription and disconnect. Safe to repeat.
    pub fn shutdown(&self) {
        self.aggregator.stop();
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
        }
        self.subscriptions.lock().clear();
        self.transport.disconnect();
    }

    // ------------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------------

    /// Bring a conversation to the foreground: clears its unread count and
    /// loads the newest page.
    pub async fn open_conversation(&self, key: ConversationKey) -> Result<usize> {
        self.foreground.set(key);
        self.directory.lock().mark_read(&key);
        let loaded = self.load_page(key, 0).await;
        self.aggregator.poll_now();
        loaded
    }

    pub fn close_conversation(&self) {
        self.foreground.clear();
    }

    /// Fetch and merge one history page. Returns how many messages were new.
    ///
    /// A page that arrives after the open conversation changed is discarded.
    /// Page 0 replaces the timeline but keeps live pushes that landed while
    /// it was being fetched.
    pub async fn load_page(&self, key: ConversationKey, page: u32) -> Result<usize> {
        let epoch = self.foreground.epoch();
        let mark = self.timelines.lock().get(&key).map_or(0, MessageTimeline::mark);
        let size = self.config.chat.page_size;
        let batch = self.api.list_messages(key, page, size).await?;

        if self.foreground.epoch() != epoch {
            tracing::debug!("Discarding page {} for {}, conversation changed", page, key);
            return Ok(0);
        }

        let (added, newest) = {
            let mut timelines = self.timelines.lock();
            let timeline = timelines
                .entry(key)
                .or_insert_with(|| MessageTimeline::new(self.me, key));
            let added = if page == 0 {
                timeline.reload(batch, size, mark)
            } else {
                timeline.apply_page(page, batch, size)
            };
            (added, timeline.newest().map(|m| m.timestamp))
        };

        if page == 0 && self.foreground.is(&key) {
            if let Some(up_to) = newest {
                self.transport
                    .send_read_receipt(key.ride_id, key.counterpart_id, up_to);
            }
        }
        Ok(added)
    }

    /// Load the next older page. `None` once history is exhausted.
    pub async fn load_older(&self, key: ConversationKey) -> Result<Option<usize>> {
        let next = self
            .timelines
            .lock()
            .get(&key)
            .map_or(Some(0), MessageTimeline::next_page);
        match next {
            Some(page) => self.load_page(key, page).await.map(Some),
            None => Ok(None),
        }
    }

    /// Publish a message. Delivery is confirmed only by the server echo.
    pub fn send_message(&self, key: ConversationKey, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::EmptyMessage);
        }
        if self.directory.lock().is_closed(&key) {
            return Err(Error::ConversationClosed(key.ride_id));
        }

        self.transport
            .send_message(key.ride_id, key.counterpart_id, text);

        let sent = Message {
            id: None,
            ride_id: key.ride_id,
            from_id: self.me,
            to_id: key.counterpart_id,
            content: text.to_string(),
            timestamp: Utc::now(),
            read: false,
        };
        self.directory.lock().apply_outgoing(&sent);
        Ok(())
    }

    pub async fn delete_conversation(&self, key: ConversationKey) -> Result<()> {
        self.api.delete_conversation(key).await?;
        self.directory.lock().remove(&key);
        self.timelines.lock().remove(&key);
        Ok(())
    }

    /// Replace the directory with the server's listing.
    pub async fn refresh_conversations(&self) -> Result<usize> {
        let listing = self.api.list_conversations().await?;
        let mut directory = self.directory.lock();
        directory.refresh(listing);
        Ok(directory.len())
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    /// Most recent first.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.directory.lock().sorted()
    }

    pub fn conversation(&self, key: &ConversationKey) -> Option<Conversation> {
        self.directory.lock().get(key).cloned()
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.timelines
            .lock()
            .get(key)
            .map(|t| t.messages().to_vec())
            .unwrap_or_default()
    }

    /// Unread across the directory, excluding the open conversation.
    pub fn directory_unread(&self) -> u32 {
        self.directory.lock().total_unread()
    }

    pub fn badge(&self) -> watch::Receiver<u32> {
        self.aggregator.badge()
    }

    pub fn foreground(&self) -> Option<ConversationKey> {
        self.foreground.get()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn add_listener<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        self.transport.add_listener(callback)
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timeline_listener(
    me: EmpId,
    timelines: Timelines,
    foreground: Foreground,
    publisher: Publisher,
) -> impl Fn(&PushEvent) + Send + Sync + 'static {
    move |event| match event {
        PushEvent::ChatMessage(msg) => {
            let key = msg.conversation_key(me);
            let open = foreground.is(&key);
            let receipt = {
                let mut timelines = timelines.lock();
                // Only loaded conversations keep a timeline; the open one always does.
                if !open && !timelines.contains_key(&key) {
                    return;
                }
                let timeline = timelines
                    .entry(key)
                    .or_insert_with(|| MessageTimeline::new(me, key));
                let added = timeline.append_live(msg.clone());
                if added && open && msg.to_id == me {
                    timeline.newest().map(|m| m.timestamp)
                } else {
                    None
                }
            };
            if let Some(up_to) = receipt {
                publisher.send_read_receipt(key.ride_id, key.counterpart_id, up_to);
            }
        }
        PushEvent::ReadReceipt {
            ride_id,
            reader,
            up_to,
        } => {
            if *reader == me {
                return;
            }
            let key = ConversationKey::new(*ride_id, *reader);
            if let Some(timeline) = timelines.lock().get_mut(&key) {
                timeline.mark_read_up_to(*up_to);
            }
        }
        PushEvent::Deleted { .. } => {
            if let Some(key) = event.deleted_key(me) {
                timelines.lock().remove(&key);
            }
        }
        PushEvent::Closed { .. } => {}
    }
}

fn directory_listener(
    me: EmpId,
    directory: Arc<Mutex<ConversationDirectory>>,
) -> impl Fn(&PushEvent) + Send + Sync + 'static {
    move |event| match event {
        PushEvent::ChatMessage(msg) => {
            let mut directory = directory.lock();
            if msg.is_from(me) {
                directory.apply_outgoing(msg);
            } else {
                directory.apply_incoming(msg);
            }
        }
        PushEvent::Closed { ride_id } => {
            let closed = directory.lock().mark_closed(*ride_id);
            tracing::info!("Chat for ride {} closed ({} conversations)", ride_id, closed);
        }
        PushEvent::Deleted { .. } => {
            if let Some(key) = event.deleted_key(me) {
                directory.lock().remove(&key);
            }
        }
        PushEvent::ReadReceipt { .. } => {}
    }
}
