//! Persistence trait: the abstract interface for local chat state.
//!
//! The sync engine and the messenger are storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use chatsync_core::{ChatId, ChatState, Message, MessageId, NodeId, VectorClock};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Result of inserting a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// Message was inserted.
    Inserted,
    /// A message with this id already exists (idempotent, not an error).
    AlreadyExists,
}

/// A pending ledger submission.
///
/// The ciphertext itself lives on the message row; the entry only tracks
/// that the submission has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    /// When the entry was created (Unix ms).
    pub created_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn new(message: &Message, created_at: i64) -> Self {
        Self {
            message_id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            created_at,
            attempts: 0,
            last_error: None,
        }
    }
}

/// Saved logical clock for the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub lamport: u64,
    pub vector: VectorClock,
}

/// Async interface for local message and chat persistence.
///
/// # Design Notes
///
/// - **Idempotent inserts**: adding the same message id twice returns
///   `AlreadyExists` and leaves the stored copy untouched.
/// - **Ordering**: messages come back ordered by timestamp, then Lamport
///   stamp, then id.
/// - **Single writer per chat**: callers serialize read-modify-write cycles
///   for one chat; the store only guarantees each call is atomic.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Message Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// All messages of a chat in display order.
    async fn get_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>>;

    async fn get_message(&self, id: &MessageId) -> Result<Option<Message>>;

    async fn add_message(&self, message: &Message) -> Result<InsertResult>;

    /// Replace a stored message. Fails with `NotFound` if it does not exist.
    async fn update_message(&self, message: &Message) -> Result<()>;

    /// Delete one message. Returns whether it existed.
    async fn remove_message(&self, id: &MessageId) -> Result<bool>;

    /// Insert a locally authored message together with its outbox entry.
    ///
    /// Both rows are written or neither is.
    async fn add_outgoing(&self, message: &Message, entry: &OutboxEntry) -> Result<InsertResult>;

    // ─────────────────────────────────────────────────────────────────────────
    // Chat Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// All chats, most recently active first.
    async fn get_chats(&self) -> Result<Vec<ChatState>>;

    async fn get_chat(&self, id: &ChatId) -> Result<Option<ChatState>>;

    /// Insert or replace a chat.
    async fn update_chat(&self, chat: &ChatState) -> Result<()>;

    /// Delete all messages and outbox entries of a chat. The chat itself is
    /// kept. Returns the number of messages removed.
    async fn clear_chat(&self, id: &ChatId) -> Result<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Outbox Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn enqueue_outbox(&self, entry: &OutboxEntry) -> Result<()>;

    /// Pending entries, oldest first.
    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>>;

    /// Record a failed attempt.
    async fn record_outbox_failure(&self, id: &MessageId, error: &str) -> Result<()>;

    async fn remove_outbox(&self, id: &MessageId) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Clock Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the saved clock for a node, if any.
    async fn load_clock(&self, node: &NodeId) -> Result<Option<ClockSnapshot>>;

    async fn save_clock(&self, node: &NodeId, snapshot: &ClockSnapshot) -> Result<()>;
}

/// Sort key shared by every backend.
pub(crate) fn display_cmp(a: &Message, b: &Message) -> std::cmp::Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.lamport.cmp(&b.lamport))
        .then_with(|| a.id.cmp(&b.id))
}

/// Chat list order: most recent activity first, then id.
pub(crate) fn chat_cmp(a: &ChatState, b: &ChatState) -> std::cmp::Ordering {
    b.last_message_time
        .cmp(&a.last_message_time)
        .then_with(|| a.id.cmp(&b.id))
}
