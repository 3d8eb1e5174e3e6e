//! Unread Aggregator - the cross-conversation badge.
//!
//! The server's unread count is authoritative and re-fetched on a fixed
//! interval. Between polls, pushed messages addressed to the local user bump
//! the badge; read and delete events trigger an immediate re-poll instead of
//! a local decrement. A failed poll leaves the badge as it was.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::ChatApi;
use crate::directory::Foreground;
use crate::error::Result;
use crate::event::PushEvent;
use crate::models::EmpId;

struct Inner {
    me: EmpId,
    api: Arc<dyn ChatApi>,
    foreground: Foreground,
    badge: watch::Sender<u32>,
    wake: Notify,
    /// Bumped by `stop()`; polls started under an older generation are discarded.
    generation: AtomicU64,
}

impl Inner {
    async fn poll(&self) -> Result<u32> {
        let generation = self.generation.load(Ordering::SeqCst);
        match self.api.unread_count().await {
            Ok(count) => {
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.badge.send_replace(count);
                } else {
                    tracing::debug!("Discarding unread count {} from a stopped poll", count);
                }
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(
                    "Unread poll failed, keeping badge at {}: {}",
                    *self.badge.borrow(),
                    e
                );
                Err(e)
            }
        }
    }

    fn on_event(&self, event: &PushEvent) {
        match event {
            PushEvent::ChatMessage(msg) => {
                if msg.to_id != self.me || msg.is_from(self.me) {
                    return;
                }
                if self.foreground.is(&msg.conversation_key(self.me)) {
                    return;
                }
                self.badge.send_modify(|n| *n = n.saturating_add(1));
            }
            PushEvent::ReadReceipt { .. } | PushEvent::Deleted { .. } => self.wake.notify_one(),
            PushEvent::Closed { .. } => {}
        }
    }
}

pub struct UnreadAggregator {
    inner: Arc<Inner>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UnreadAggregator {
    pub fn new(
        me: EmpId,
        api: Arc<dyn ChatApi>,
        foreground: Foreground,
        interval: Duration,
    ) -> Self {
        let (badge, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                me,
                api,
                foreground,
                badge,
                wake: Notify::new(),
                generation: AtomicU64::new(0),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Observe the badge from anywhere; the receiver sees every change.
    pub fn badge(&self) -> watch::Receiver<u32> {
        self.inner.badge.subscribe()
    }

    pub fn count(&self) -> u32 {
        *self.inner.badge.borrow()
    }

    /// Start the poll loop. The first poll runs immediately.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = inner.wake.notified() => {}
                }
                let _ = inner.poll().await;
            }
        }));
        tracing::debug!("Unread poll started every {:?}", period);
    }

    pub fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!("Unread poll stopped");
        }
    }

    /// Ask the running loop for an immediate re-poll.
    pub fn poll_now(&self) {
        self.inner.wake.notify_one();
    }

    /// One poll, outside the loop.
    pub async fn poll(&self) -> Result<u32> {
        self.inner.poll().await
    }

    pub fn on_event(&self, event: &PushEvent) {
        self.inner.on_event(event);
    }

    /// Transport listener feeding this aggregator.
    pub fn listener(&self) -> impl Fn(&PushEvent) + Send + Sync + 'static {
        let inner = Arc::clone(&self.inner);
        move |event| inner.on_event(event)
    }
}

impl Drop for UnreadAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MemoryApi;
    use crate::models::{ConversationKey, Message, RideId};
    use chrono::{TimeZone, Utc};

    const ME: EmpId = EmpId(1);

    fn message(from: i64, to: i64, ride: i64) -> PushEvent {
        PushEvent::ChatMessage(Message {
            id: None,
            ride_id: RideId(ride),
            from_id: EmpId(from),
            to_id: EmpId(to),
            content: "hey".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            read: false,
        })
    }

    fn read_event(reader: i64) -> PushEvent {
        PushEvent::ReadReceipt {
            ride_id: RideId(1),
            reader: EmpId(reader),
            up_to: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        }
    }

    fn aggregator(api: Arc<MemoryApi>, foreground: Foreground, interval: Duration) -> UnreadAggregator {
        UnreadAggregator::new(ME, api, foreground, interval)
    }

    async fn wait_for_calls(api: &MemoryApi, calls: usize) {
        for _ in 0..200 {
            if api.unread_calls() >= calls {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} unread polls, saw {}", calls, api.unread_calls());
    }

    #[tokio::test]
    async fn test_push_increments_only_for_background_incoming() {
        let api = MemoryApi::new();
        let foreground = Foreground::new();
        let unread = aggregator(api, foreground.clone(), Duration::from_secs(3600));

        unread.on_event(&message(2, 1, 7));
        unread.on_event(&message(1, 2, 7));
        unread.on_event(&message(2, 3, 7));
        assert_eq!(unread.count(), 1);

        foreground.set(ConversationKey::new(RideId(7), EmpId(2)));
        unread.on_event(&message(2, 1, 7));
        assert_eq!(unread.count(), 1);

        unread.on_event(&message(4, 1, 8));
        assert_eq!(unread.count(), 2);
    }

    #[tokio::test]
    async fn test_read_event_repolls_instead_of_decrementing() {
        let api = MemoryApi::new();
        api.set_unread(Some(2));
        let unread = aggregator(api.clone(), Foreground::new(), Duration::from_secs(3600));

        unread.start();
        wait_for_calls(&api, 1).await;
        let mut badge = unread.badge();
        assert_eq!(*badge.borrow_and_update(), 2);

        api.set_unread(Some(0));
        unread.on_event(&read_event(2));
        wait_for_calls(&api, 2).await;
        badge.changed().await.unwrap();
        assert_eq!(*badge.borrow(), 0);
        unread.stop();
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_stale_value() {
        let api = MemoryApi::new();
        api.set_unread(Some(4));
        let unread = aggregator(api.clone(), Foreground::new(), Duration::from_secs(3600));
        assert_eq!(unread.poll().await.unwrap(), 4);

        api.set_unread(None);
        assert!(unread.poll().await.is_err());
        assert_eq!(unread.count(), 4);

        unread.on_event(&message(2, 1, 1));
        assert!(unread.poll().await.is_err());
        assert_eq!(unread.count(), 5);
    }

    #[tokio::test]
    async fn test_interval_polls_and_stop_cancels() {
        let api = MemoryApi::new();
        let unread = aggregator(api.clone(), Foreground::new(), Duration::from_millis(20));
        unread.start();
        unread.start();
        wait_for_calls(&api, 3).await;

        unread.stop();
        let calls = api.unread_calls();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(api.unread_calls(), calls);

        api.set_unread(Some(9));
        unread.poll_now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(unread.count(), 0);
    }

    #[tokio::test]
    async fn test_closed_event_is_ignored() {
        let api = MemoryApi::new();
        let unread = aggregator(api.clone(), Foreground::new(), Duration::from_secs(3600));
        unread.on_event(&PushEvent::Closed { ride_id: RideId(1) });
        assert_eq!(unread.count(), 0);
        assert_eq!(api.unread_calls(), 0);
    }
}
