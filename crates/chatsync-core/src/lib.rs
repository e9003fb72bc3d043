//! # chatsync core
//!
//! Pure data model for the chatsync engine: logical clocks, messages, chat
//! state and conflict resolution.
//!
//! This crate contains no I/O, no storage, no networking. Everything here is
//! deterministic computation that every replica runs identically.
//!
//! ## Key Types
//!
//! - [`LogicalClock`] - Lamport counter plus vector clock for one node
//! - [`Message`] - A chat message with its [`DeliveryStatus`]
//! - [`ChatState`] - Participants, metadata and the chat's causal clock
//! - [`ConflictResolver`] - Idempotent, commutative merges of both
//!
//! ## Sealed content
//!
//! Message metadata and bodies are CBOR-encoded inside the ciphertext. See
//! the [`envelope`] module.

pub mod chat;
pub mod clock;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod message;
pub mod resolver;
pub mod types;

pub use chat::ChatState;
pub use clock::{compare_lamport, compare_vector, CausalOrder, LamportStamp, LogicalClock, VectorClock};
pub use envelope::{MessageEnvelope, SealedContent};
pub use error::{CoreError, Result};
pub use identity::Identity;
pub use message::{DeliveryStatus, Message};
pub use resolver::{ConflictResolver, ConflictType, MergeReport, Resolution};
pub use types::{now_millis, ChatId, MessageId, NodeId, Nonce};
