//! Messages and their delivery-status state machine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::clock::{LamportStamp, VectorClock};
use crate::error::{CoreError, Result};
use crate::types::{ChatId, MessageId, NodeId, Nonce};

/// Delivery status of a message.
///
/// Advances `Sending -> Sent -> Delivered -> Read`. `Failed` is reachable
/// from `Sending` or `Sent`, and the only way back is an explicit retry
/// (`Failed -> Sending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    /// Position in the forward chain. `Failed` ranks lowest so that a
    /// confirmed copy of a failed message wins a join.
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Failed => 0,
            DeliveryStatus::Sending => 1,
            DeliveryStatus::Sent => 2,
            DeliveryStatus::Delivered => 3,
            DeliveryStatus::Read => 4,
        }
    }

    /// Whether `self -> next` is allowed without an explicit retry.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Sending | Sent, Failed) => true,
            (Failed, _) => false,
            (_, Failed) => false,
            (a, b) => b.rank() > a.rank(),
        }
    }

    /// Least upper bound of two observations of the same message.
    pub fn join(self, other: DeliveryStatus) -> DeliveryStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(DeliveryStatus::Sending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// A chat message.
///
/// `plaintext` never leaves the client. Everything that travels over a
/// transport or to the ledger is in `ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    /// Decrypted body, local only. `None` when the message is undecryptable.
    pub plaintext: Option<String>,
    pub ciphertext: Bytes,
    pub nonce: Nonce,
    pub sender_id: NodeId,
    /// Hex commitment to the sender identity as published on the ledger.
    pub sender_commitment: String,
    /// Wall-clock send time (Unix ms). Display order only.
    pub timestamp: i64,
    pub lamport: LamportStamp,
    pub vector: VectorClock,
    pub status: DeliveryStatus,
    pub reply_to: Option<MessageId>,
    pub version: u64,
    /// Set when the ciphertext failed authentication with our chat key.
    pub undecryptable: bool,
}

impl Message {
    /// Whether two copies carry the same content, ignoring local-only
    /// fields (status, plaintext, version).
    pub fn same_content(&self, other: &Message) -> bool {
        self.id == other.id
            && self.chat_id == other.chat_id
            && self.ciphertext == other.ciphertext
            && self.nonce == other.nonce
            && self.sender_id == other.sender_id
            && self.sender_commitment == other.sender_commitment
            && self.timestamp == other.timestamp
            && self.lamport == other.lamport
            && self.vector == other.vector
            && self.reply_to == other.reply_to
    }

    /// Fold the local-only state of another copy of this message into self.
    ///
    /// Symmetric in outcome: `a.absorb(b)` and `b.absorb(a)` agree on
    /// status, plaintext and version.
    pub fn absorb(&mut self, other: &Message) {
        self.status = self.status.join(other.status);
        self.version = self.version.max(other.version);
        self.plaintext = match (self.plaintext.take(), &other.plaintext) {
            (Some(a), Some(b)) => Some(if *b > a { b.clone() } else { a }),
            (Some(a), None) => Some(a),
            (None, b) => b.clone(),
        };
        self.undecryptable = self.plaintext.is_none() && (self.undecryptable || other.undecryptable);
    }

    /// Move to `next`, rejecting regressions.
    pub fn transition(&mut self, next: DeliveryStatus) -> Result<bool> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.version = self.version.saturating_add(1);
        Ok(true)
    }

    /// Advance to `next` if it is ahead of the current status, otherwise
    /// leave the message alone. Used for confirmations that may race with
    /// merges that already advanced the status further.
    pub fn advance_to(&mut self, next: DeliveryStatus) -> bool {
        if self.status != next && self.status.can_transition_to(next) {
            self.status = next;
            self.version = self.version.saturating_add(1);
            true
        } else {
            false
        }
    }

    /// The explicit `Failed -> Sending` retry edge.
    pub fn retry(&mut self) -> Result<()> {
        if self.status != DeliveryStatus::Failed {
            return Err(CoreError::NotFailed(self.id.clone()));
        }
        self.status = DeliveryStatus::Sending;
        self.version = self.version.saturating_add(1);
        Ok(())
    }

    pub fn is_from(&self, node: &NodeId) -> bool {
        &self.sender_id == node
    }
}
