//! Message Timeline - ordered, deduplicated log of one conversation.
//!
//! History pages (newest-first from the server) and live pushes are merged
//! into one ascending-by-timestamp log. A message is recognised as already
//! present by its server id or, when either side lacks an id, by its
//! synthetic key, so the same message arriving by push and by page fetch is
//! stored once.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::models::{ConversationKey, EmpId, Message};

#[derive(Debug, Clone)]
pub struct MessageTimeline {
    me: EmpId,
    key: ConversationKey,
    messages: Vec<Message>,
    /// Insertion sequence of each entry in `messages`, index for index.
    seqs: Vec<u64>,
    next_seq: u64,
    ids: HashSet<i64>,
    synthetic: HashSet<String>,
    highest_page: Option<u32>,
    exhausted: bool,
}

impl MessageTimeline {
    pub fn new(me: EmpId, key: ConversationKey) -> Self {
        Self {
            me,
            key,
            messages: Vec::new(),
            seqs: Vec::new(),
            next_seq: 0,
            ids: HashSet::new(),
            synthetic: HashSet::new(),
            highest_page: None,
            exhausted: false,
        }
    }

    pub fn key(&self) -> ConversationKey {
        self.key
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn newest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Next history page to request, or `None` once a short page was seen.
    pub fn next_page(&self) -> Option<u32> {
        if self.exhausted {
            return None;
        }
        Some(self.highest_page.map_or(0, |p| p + 1))
    }

    /// Position in the insertion sequence. Entries added from here on survive
    /// a later [`reload`](Self::reload) taken against this mark.
    pub fn mark(&self) -> u64 {
        self.next_seq
    }

    /// Merge one history page. Page 0 replaces the log; later pages only add
    /// older messages. Returns how many messages were new.
    pub fn apply_page(&mut self, page: u32, batch: Vec<Message>, page_size: u32) -> usize {
        if page == 0 {
            return self.reload(batch, page_size, self.mark());
        }
        self.merge_page(page, batch, page_size)
    }

    /// Replace the log with a fresh newest page fetched after `mark` was
    /// taken. Entries inserted since the mark (live pushes that raced the
    /// fetch) are kept and merged with the page.
    pub fn reload(&mut self, batch: Vec<Message>, page_size: u32, mark: u64) -> usize {
        let messages = std::mem::take(&mut self.messages);
        let seqs = std::mem::take(&mut self.seqs);
        self.ids.clear();
        self.synthetic.clear();
        self.highest_page = None;
        self.exhausted = false;

        for (msg, seq) in messages.into_iter().zip(seqs) {
            if seq < mark {
                continue;
            }
            if let Some(id) = msg.id {
                self.ids.insert(id);
            }
            self.synthetic.insert(msg.synthetic_key());
            self.messages.push(msg);
            self.seqs.push(seq);
        }
        self.merge_page(0, batch, page_size)
    }

    fn merge_page(&mut self, page: u32, batch: Vec<Message>, page_size: u32) -> usize {
        self.exhausted = (batch.len() as u64) < u64::from(page_size);
        self.highest_page = Some(self.highest_page.map_or(page, |p| p.max(page)));

        let (me, key) = (self.me, self.key);
        let mut inserted = 0;
        // Pages arrive newest-first.
        for msg in batch.into_iter().rev() {
            if msg.conversation_key(me) != key {
                tracing::debug!(
                    "Paged message for {} ignored by timeline {}",
                    msg.conversation_key(me),
                    key
                );
                continue;
            }
            if self.insert(msg) {
                inserted += 1;
            }
        }
        inserted
    }

    /// Insert a pushed message unless it is already present.
    pub fn append_live(&mut self, msg: Message) -> bool {
        if msg.conversation_key(self.me) != self.key {
            tracing::debug!(
                "Message for {} ignored by timeline {}",
                msg.conversation_key(self.me),
                self.key
            );
            return false;
        }
        self.insert(msg)
    }

    /// Flag the local user's own messages up to `up_to` as read by the counterpart.
    pub fn mark_read_up_to(&mut self, up_to: DateTime<Utc>) -> usize {
        let me = self.me;
        let mut flipped = 0;
        for msg in self
            .messages
            .iter_mut()
            .filter(|m| m.from_id == me && m.timestamp <= up_to && !m.read)
        {
            msg.read = true;
            flipped += 1;
        }
        flipped
    }

    fn position_of(&self, msg: &Message) -> Option<usize> {
        if let Some(id) = msg.id {
            if self.ids.contains(&id) {
                return self.messages.iter().position(|m| m.id == Some(id));
            }
        }
        let synthetic = msg.synthetic_key();
        if !self.synthetic.contains(&synthetic) {
            return None;
        }
        // Two distinct server ids never collapse into one entry.
        self.messages.iter().position(|m| {
            (m.id.is_none() || msg.id.is_none() || m.id == msg.id) && m.synthetic_key() == synthetic
        })
    }

    fn insert(&mut self, msg: Message) -> bool {
        if let Some(at) = self.position_of(&msg) {
            let existing = &mut self.messages[at];
            if existing.id.is_none() {
                if let Some(id) = msg.id {
                    existing.id = Some(id);
                    self.ids.insert(id);
                }
            }
            existing.read |= msg.read;
            return false;
        }

        if let Some(id) = msg.id {
            self.ids.insert(id);
        }
        self.synthetic.insert(msg.synthetic_key());

        // Stable: equal timestamps keep insertion order.
        let at = self.messages.partition_point(|m| m.timestamp <= msg.timestamp);
        self.messages.insert(at, msg);
        self.seqs.insert(at, self.next_seq);
        self.next_seq += 1;
        true
    }
}
