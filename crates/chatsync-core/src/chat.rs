//! Chat state: participants, metadata and the chat's causal clock.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::clock::VectorClock;
use crate::message::Message;
use crate::types::{ChatId, NodeId};

/// Replicated state of a chat or group.
///
/// Mutated by conflict-resolution merges and by new-message arrival. Writes
/// for a single chat must be serialized by the owner of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatState {
    pub id: ChatId,
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub participants: BTreeSet<NodeId>,
    pub vector: VectorClock,
    /// Wall-clock time of the newest message (Unix ms).
    pub last_message_time: i64,
    pub unread_count: u32,
    /// Local clear watermark (Unix ms). Messages at or before it are not
    /// merged back in. Never broadcast.
    pub cleared_before: i64,
    pub version: u64,
}

impl ChatState {
    pub fn new(id: ChatId) -> Self {
        Self {
            id,
            name: None,
            avatar: None,
            participants: BTreeSet::new(),
            vector: VectorClock::new(),
            last_message_time: 0,
            unread_count: 0,
            cleared_before: 0,
            version: 0,
        }
    }

    pub fn with_participants<I: IntoIterator<Item = NodeId>>(mut self, participants: I) -> Self {
        self.participants.extend(participants);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Account for messages newly merged into this chat.
    ///
    /// Messages authored by `local` do not count as unread. The chat's
    /// vector clock only tracks metadata and membership edits, so message
    /// arrival leaves it untouched.
    pub fn apply_new_messages<'a, I>(&mut self, messages: I, local: &NodeId) -> bool
    where
        I: IntoIterator<Item = &'a Message>,
    {
        let mut changed = false;
        for msg in messages {
            changed = true;
            self.last_message_time = self.last_message_time.max(msg.timestamp);
            if msg.undecryptable {
                continue;
            }
            self.participants.insert(msg.sender_id.clone());
            if !msg.is_from(local) {
                self.unread_count = self.unread_count.saturating_add(1);
            }
        }
        if changed {
            self.version = self.version.saturating_add(1);
        }
        changed
    }

    /// Record a local clear of every message up to `through`.
    pub fn clear(&mut self, through: i64) {
        self.cleared_before = self.cleared_before.max(through);
        self.unread_count = 0;
        self.version = self.version.saturating_add(1);
    }

    /// Whether a message was removed by a local clear.
    pub fn is_cleared(&self, message: &Message) -> bool {
        message.timestamp <= self.cleared_before
    }

    pub fn mark_read(&mut self) -> bool {
        if self.unread_count == 0 {
            return false;
        }
        self.unread_count = 0;
        self.version = self.version.saturating_add(1);
        true
    }
}
