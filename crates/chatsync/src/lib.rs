//! # chatsync
//!
//! The unified API for encrypted chat sync over a shared ledger.
//!
//! ## Overview
//!
//! chatsync is an offline-first messaging library:
//!
//! - **Messages**: Sealed on the device, stored optimistically, then
//!   submitted to a remote ledger through a durable outbox
//! - **Chats**: Replicated metadata merged by vector clock
//! - **Sync**: A poll loop with circuit breaker plus an optional push
//!   channel for low latency
//! - **Events**: Every change reported through one broadcast stream
//!
//! ## Key Concepts
//!
//! - **Ledger**: The remote, append-only source of truth. Only ever sees
//!   ciphertext.
//! - **Outbox**: Sends the ledger has not yet accepted. Survives restarts.
//! - **Delivery status**: `Sending -> Sent -> Delivered -> Read`, with
//!   `Failed` as the retryable side branch.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatsync::{EngineParts, Identity, Messenger, MessengerConfig};
//! use chatsync::crypto::ChaChaBox;
//! use chatsync::store::SqliteStore;
//! use chatsync::sync::MemoryLedger;
//!
//! async fn example() {
//!     let parts = EngineParts {
//!         identity: Identity::generate(),
//!         store: Arc::new(SqliteStore::open("chatsync.db").unwrap()),
//!         ledger: Arc::new(MemoryLedger::new()),
//!         crypto: Arc::new(ChaChaBox::new()),
//!         push: None,
//!     };
//!     let messenger = Messenger::open(parts, MessengerConfig::default()).await.unwrap();
//!     messenger.start().await;
//!
//!     let mut events = messenger.subscribe();
//!     messenger
//!         .send_message(&"general".into(), "hello", false, None)
//!         .await
//!         .unwrap();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.name());
//!     }
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `chatsync::core` - Ids, clocks, messages and the conflict resolver
//! - `chatsync::crypto` - Chat keys and authenticated encryption
//! - `chatsync::store` - Storage abstraction, SQLite and in-memory stores
//! - `chatsync::sync` - Sync engine, transports and the ledger interface

pub mod error;
pub mod messenger;

// Re-export component crates
pub use chatsync_core as core;
pub use chatsync_crypto as crypto;
pub use chatsync_store as store;
pub use chatsync_sync as sync;

pub use error::{MessengerError, Result};
pub use messenger::{Messenger, MessengerConfig};

// Re-export commonly used types
pub use chatsync_core::{
    ChatId, ChatState, DeliveryStatus, Identity, Message, MessageId, NodeId,
};
pub use chatsync_sync::{EngineHealth, EngineParts, SyncConfig, SyncEvent};
