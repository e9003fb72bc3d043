//! # chatsync store
//!
//! Local persistence for messages, chats, the ledger outbox and the node's
//! logical clock.
//!
//! ## Key Types
//!
//! - [`Persistence`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`OutboxEntry`] - A ledger submission awaiting confirmation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chatsync_store::{Persistence, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("chatsync.db").unwrap();
//!     let chats = store.get_chats().await.unwrap();
//!     println!("{} chats", chats.len());
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ClockSnapshot, InsertResult, OutboxEntry, Persistence};

#[cfg(test)]
pub(crate) mod testutil {
    use bytes::Bytes;
    use chatsync_core::{DeliveryStatus, LamportStamp, Message, Nonce, VectorClock};

    pub(crate) fn message(id: &str, chat: &str, timestamp: i64) -> Message {
        Message {
            id: id.into(),
            chat_id: chat.into(),
            plaintext: Some(format!("body of {}", id)),
            ciphertext: Bytes::from(format!("ct-{}", id).into_bytes()),
            nonce: Nonce::from_bytes([1; 12]),
            sender_id: "alice".into(),
            sender_commitment: "commit".into(),
            timestamp,
            lamport: LamportStamp::new(timestamp as u64, "alice".into()),
            vector: VectorClock::from_entries([("alice", timestamp as u64)]),
            status: DeliveryStatus::Delivered,
            reply_to: None,
            version: 0,
            undecryptable: false,
        }
    }
}
