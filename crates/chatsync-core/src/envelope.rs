//! Sealed content: what goes inside the ciphertext.
//!
//! Ledger records and push payloads expose only ciphertext, nonce, sender
//! commitment and a timestamp. The message id, logical clocks, reply target
//! and body travel encrypted as CBOR so nothing about the conversation is
//! visible to a transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chat::ChatState;
use crate::clock::{LamportStamp, VectorClock};
use crate::error::{CoreError, Result};
use crate::message::{DeliveryStatus, Message};
use crate::types::{ChatId, MessageId, NodeId, Nonce};

/// Current sealed-content format version.
pub const ENVELOPE_VERSION: u8 = 0;

/// Message fields carried inside the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub body: String,
    pub sender_id: NodeId,
    pub sent_at: i64,
    pub lamport: LamportStamp,
    pub vector: VectorClock,
    pub reply_to: Option<MessageId>,
}

impl MessageEnvelope {
    /// Rebuild a full message around the sealed fields.
    pub fn into_message(
        self,
        ciphertext: Bytes,
        nonce: Nonce,
        sender_commitment: String,
        status: DeliveryStatus,
    ) -> Message {
        Message {
            id: self.id,
            chat_id: self.chat_id,
            plaintext: Some(self.body),
            ciphertext,
            nonce,
            sender_id: self.sender_id,
            sender_commitment,
            timestamp: self.sent_at,
            lamport: self.lamport,
            vector: self.vector,
            status,
            reply_to: self.reply_to,
            version: 0,
            undecryptable: false,
        }
    }
}

/// Anything that can be sealed for a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealedContent {
    Message(MessageEnvelope),
    ChatState(ChatState),
}

#[derive(Serialize, Deserialize)]
struct Versioned {
    v: u8,
    content: SealedContent,
}

impl SealedContent {
    /// Seal a chat state for broadcast. Unread counts and the clear
    /// watermark are per device and are zeroed.
    pub fn chat_state(state: &ChatState) -> Self {
        let mut state = state.clone();
        state.unread_count = 0;
        state.cleared_before = 0;
        SealedContent::ChatState(state)
    }

    pub fn chat_id(&self) -> &ChatId {
        match self {
            SealedContent::Message(m) => &m.chat_id,
            SealedContent::ChatState(s) => &s.id,
        }
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let versioned = Versioned {
            v: ENVELOPE_VERSION,
            content: self.clone(),
        };
        ciborium::into_writer(&versioned, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let versioned: Versioned =
            ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))?;
        if versioned.v != ENVELOPE_VERSION {
            return Err(CoreError::DecodingError(format!(
                "unsupported envelope version: {}",
                versioned.v
            )));
        }
        Ok(versioned.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            id: "m1".into(),
            chat_id: "chat".into(),
            body: "hello".into(),
            sender_id: "alice".into(),
            sent_at: 1_700_000_000_000,
            lamport: LamportStamp::new(3, "alice".into()),
            vector: VectorClock::from_entries([("alice", 3)]),
            reply_to: Some("m0".into()),
        }
    }

    #[test]
    fn test_sealed_message_decodes() {
        let sealed = SealedContent::Message(envelope());
        let bytes = sealed.to_bytes().unwrap();
        assert_eq!(SealedContent::from_bytes(&bytes).unwrap(), sealed);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(SealedContent::from_bytes(b"not cbor at all").is_err());
    }

    #[test]
    fn test_chat_state_unread_is_zeroed() {
        let mut state = ChatState::new("chat".into());
        state.unread_count = 7;
        match SealedContent::chat_state(&state) {
            SealedContent::ChatState(s) => assert_eq!(s.unread_count, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_into_message_keeps_sealed_fields() {
        let msg = envelope().into_message(
            Bytes::from_static(b"ct"),
            Nonce::ZERO,
            "commit".into(),
            DeliveryStatus::Delivered,
        );
        assert_eq!(msg.plaintext.as_deref(), Some("hello"));
        assert_eq!(msg.timestamp, 1_700_000_000_000);
        assert_eq!(msg.reply_to, Some("m0".into()));
        assert!(!msg.undecryptable);
    }
}
