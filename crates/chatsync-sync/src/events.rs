//! Events surfaced to the host application.

use chatsync_core::{ChatId, ChatState, DeliveryStatus, Message, MessageId, NodeId};
use serde::Serialize;

/// Per-cycle summary carried by [`SyncEvent::SyncSuccess`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub chats: usize,
    pub new_messages: usize,
    pub duplicates: usize,
    pub conflicts: usize,
    pub undecryptable: usize,
}

impl CycleReport {
    pub(crate) fn absorb(&mut self, other: &CycleReport) {
        self.new_messages += other.new_messages;
        self.duplicates += other.duplicates;
        self.conflicts += other.conflicts;
        self.undecryptable += other.undecryptable;
    }
}

/// Everything the engine and messenger report to the host.
///
/// Failures never cross the engine's public boundary as errors; they
/// arrive here as [`SyncEvent::SyncError`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SyncEvent {
    SyncStart,
    SyncSuccess(CycleReport),
    SyncError {
        message: String,
    },
    /// Messages not previously seen locally, after de-duplication.
    NewMessages {
        chat_id: ChatId,
        messages: Vec<Message>,
    },
    ConnectionLost {
        reason: String,
    },
    ConnectionRestored,
    /// A chat's replicated state changed through a merge.
    ChatUpdated {
        chat: ChatState,
    },
    StatusChanged {
        chat_id: ChatId,
        message_id: MessageId,
        status: DeliveryStatus,
    },
    Typing {
        chat_id: ChatId,
        node_id: NodeId,
        typing: bool,
    },
    Presence {
        node_id: NodeId,
        online: bool,
    },
}

impl SyncEvent {
    /// Stable event name for hosts that dispatch on strings.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStart => "SYNC_START",
            SyncEvent::SyncSuccess(_) => "SYNC_SUCCESS",
            SyncEvent::SyncError { .. } => "SYNC_ERROR",
            SyncEvent::NewMessages { .. } => "NEW_MESSAGES",
            SyncEvent::ConnectionLost { .. } => "CONNECTION_LOST",
            SyncEvent::ConnectionRestored => "CONNECTION_RESTORED",
            SyncEvent::ChatUpdated { .. } => "CHAT_UPDATED",
            SyncEvent::StatusChanged { .. } => "STATUS_CHANGED",
            SyncEvent::Typing { .. } => "TYPING",
            SyncEvent::Presence { .. } => "PRESENCE",
        }
    }
}
