//! Conversation Directory - every known (ride, counterpart) thread with
//! preview, recency and unread metadata.

use chrono::Utc;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{Conversation, ConversationKey, ConversationSummary, EmpId, Message, RideId};

/// The conversation currently open in the foreground, shared between the
/// directory, the timelines and the unread aggregator.
///
/// Every change of the open conversation bumps an epoch; async work started
/// under an older epoch must not apply its result.
#[derive(Clone, Default)]
pub struct Foreground {
    slot: Arc<RwLock<Slot>>,
}

#[derive(Default)]
struct Slot {
    key: Option<ConversationKey>,
    epoch: u64,
}

impl Foreground {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<ConversationKey> {
        self.slot.read().key
    }

    pub fn epoch(&self) -> u64 {
        self.slot.read().epoch
    }

    pub fn set(&self, key: ConversationKey) {
        let mut slot = self.slot.write();
        slot.key = Some(key);
        slot.epoch += 1;
    }

    pub fn clear(&self) {
        let mut slot = self.slot.write();
        slot.key = None;
        slot.epoch += 1;
    }

    /// Clear only if `key` is the open conversation.
    pub fn clear_if(&self, key: &ConversationKey) -> bool {
        let mut slot = self.slot.write();
        if slot.key.as_ref() != Some(key) {
            return false;
        }
        slot.key = None;
        slot.epoch += 1;
        true
    }

    pub fn is(&self, key: &ConversationKey) -> bool {
        self.slot.read().key.as_ref() == Some(key)
    }
}

pub struct ConversationDirectory {
    me: EmpId,
    foreground: Foreground,
    entries: HashMap<ConversationKey, Conversation>,
    closed_rides: HashSet<RideId>,
}

impl ConversationDirectory {
    pub fn new(me: EmpId, foreground: Foreground) -> Self {
        Self {
            me,
            foreground,
            entries: HashMap::new(),
            closed_rides: HashSet::new(),
        }
    }

    /// Replace the directory with a server listing.
    pub fn refresh(&mut self, listing: Vec<ConversationSummary>) {
        let now = Utc::now();
        let mut entries = HashMap::with_capacity(listing.len());

        for summary in listing {
            let key = summary.key();
            let listed_at = self.entries.get(&key).map_or(now, |c| c.listed_at);
            entries.insert(
                key,
                Conversation {
                    key,
                    counterpart_name: summary.counterpart_name,
                    last_preview: summary.last_preview,
                    last_timestamp: summary.last_timestamp,
                    listed_at,
                    unread_count: summary.unread_count,
                    closed: self.closed_rides.contains(&key.ride_id),
                },
            );
        }

        tracing::debug!("Conversation directory refreshed with {} entries", entries.len());
        self.entries = entries;
    }

    /// A message from the counterpart, or any message not authored locally.
    pub fn apply_incoming(&mut self, msg: &Message) {
        let key = msg.conversation_key(self.me);
        let counts_unread = msg.to_id == self.me && !self.foreground.is(&key);
        let conversation = self.touch(key, msg);
        if counts_unread {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
    }

    /// A message the local user sent; never changes the unread count.
    pub fn apply_outgoing(&mut self, msg: &Message) {
        let key = msg.conversation_key(self.me);
        self.touch(key, msg);
    }

    pub fn remove(&mut self, key: &ConversationKey) -> Option<Conversation> {
        if self.foreground.clear_if(key) {
            tracing::debug!("Open conversation {} was removed", key);
        }
        self.entries.remove(key)
    }

    /// Close every conversation of `ride_id`, including ones created later.
    pub fn mark_closed(&mut self, ride_id: RideId) -> usize {
        self.closed_rides.insert(ride_id);
        let mut closed = 0;
        for conversation in self.entries.values_mut().filter(|c| c.key.ride_id == ride_id) {
            conversation.closed = true;
            closed += 1;
        }
        closed
    }

    /// Explicit read action: the user looked at the conversation.
    pub fn mark_read(&mut self, key: &ConversationKey) {
        if let Some(conversation) = self.entries.get_mut(key) {
            conversation.unread_count = 0;
        }
    }

    pub fn is_closed(&self, key: &ConversationKey) -> bool {
        self.closed_rides.contains(&key.ride_id)
            || self.entries.get(key).is_some_and(|c| c.closed)
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent first; entries without messages use their listing time.
    pub fn sorted(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.entries.values().cloned().collect();
        list.sort_by_key(|c| (Reverse(c.recency()), c.key));
        list
    }

    /// Unread across every conversation except the one in the foreground.
    pub fn total_unread(&self) -> u32 {
        let open = self.foreground.get();
        self.entries
            .values()
            .filter(|c| Some(c.key) != open)
            .map(|c| c.unread_count)
            .sum()
    }

    fn touch(&mut self, key: ConversationKey, msg: &Message) -> &mut Conversation {
        let closed = self.closed_rides.contains(&key.ride_id);
        let conversation = self.entries.entry(key).or_insert_with(|| {
            let mut conversation = Conversation::new(key, Utc::now());
            conversation.closed = closed;
            conversation
        });
        // An older message arriving late must not roll the preview back.
        if conversation.last_timestamp.map_or(true, |last| msg.timestamp >= last) {
            conversation.last_preview = Some(msg.content.clone());
            conversation.last_timestamp = Some(msg.timestamp);
        }
        conversation
    }
}
