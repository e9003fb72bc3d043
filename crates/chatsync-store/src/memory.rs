//! In-memory implementation of the Persistence trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;

use async_trait::async_trait;
use chatsync_core::{ChatId, ChatState, Message, MessageId, NodeId};
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};
use crate::traits::{chat_cmp, display_cmp, ClockSnapshot, InsertResult, OutboxEntry, Persistence};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    messages: HashMap<MessageId, Message>,
    chats: HashMap<ChatId, ChatState>,
    outbox: HashMap<MessageId, OutboxEntry>,
    clocks: HashMap<NodeId, ClockSnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored messages across all chats.
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn get_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| &m.chat_id == chat_id)
            .cloned()
            .collect();
        out.sort_by(display_cmp);
        Ok(out)
    }

    async fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        Ok(self.inner.read().await.messages.get(id).cloned())
    }

    async fn add_message(&self, message: &Message) -> Result<InsertResult> {
        let mut inner = self.inner.write().await;
        if inner.messages.contains_key(&message.id) {
            return Ok(InsertResult::AlreadyExists);
        }
        inner.messages.insert(message.id.clone(), message.clone());
        Ok(InsertResult::Inserted)
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.messages.get_mut(&message.id) {
            Some(slot) => {
                *slot = message.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("message {}", message.id))),
        }
    }

    async fn remove_message(&self, id: &MessageId) -> Result<bool> {
        Ok(self.inner.write().await.messages.remove(id).is_some())
    }

    async fn add_outgoing(&self, message: &Message, entry: &OutboxEntry) -> Result<InsertResult> {
        let mut inner = self.inner.write().await;
        if inner.messages.contains_key(&message.id) {
            return Ok(InsertResult::AlreadyExists);
        }
        inner.messages.insert(message.id.clone(), message.clone());
        inner.outbox.insert(entry.message_id.clone(), entry.clone());
        Ok(InsertResult::Inserted)
    }

    async fn get_chats(&self) -> Result<Vec<ChatState>> {
        let mut out: Vec<ChatState> = self.inner.read().await.chats.values().cloned().collect();
        out.sort_by(chat_cmp);
        Ok(out)
    }

    async fn get_chat(&self, id: &ChatId) -> Result<Option<ChatState>> {
        Ok(self.inner.read().await.chats.get(id).cloned())
    }

    async fn update_chat(&self, chat: &ChatState) -> Result<()> {
        self.inner
            .write()
            .await
            .chats
            .insert(chat.id.clone(), chat.clone());
        Ok(())
    }

    async fn clear_chat(&self, id: &ChatId) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.messages.len();
        inner.messages.retain(|_, m| &m.chat_id != id);
        inner.outbox.retain(|_, e| &e.chat_id != id);
        Ok(before - inner.messages.len())
    }

    async fn enqueue_outbox(&self, entry: &OutboxEntry) -> Result<()> {
        self.inner
            .write()
            .await
            .outbox
            .entry(entry.message_id.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>> {
        let mut out: Vec<OutboxEntry> = self.inner.read().await.outbox.values().cloned().collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(out)
    }

    async fn record_outbox_failure(&self, id: &MessageId, error: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.outbox.get_mut(id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn remove_outbox(&self, id: &MessageId) -> Result<()> {
        self.inner.write().await.outbox.remove(id);
        Ok(())
    }

    async fn load_clock(&self, node: &NodeId) -> Result<Option<ClockSnapshot>> {
        Ok(self.inner.read().await.clocks.get(node).cloned())
    }

    async fn save_clock(&self, node: &NodeId, snapshot: &ClockSnapshot) -> Result<()> {
        self.inner
            .write()
            .await
            .clocks
            .insert(node.clone(), snapshot.clone());
        Ok(())
    }
}
