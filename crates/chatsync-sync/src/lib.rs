//! # chatsync sync
//!
//! Keeps local chat state converged with a remote ledger over two
//! transports: a persistent push channel and a polling pull channel.
//!
//! ## Overview
//!
//! The ledger is the source of truth. Every poll cycle fetches each
//! registered chat's records, decrypts them, and merges them into local
//! storage through the conflict resolver. Push traffic is merged the moment
//! it arrives and then double-checked by one follow-up poll.
//!
//! ## Key Properties
//!
//! - **Single-flight**: At most one poll cycle runs at a time
//! - **Coalescing**: Requests during a cycle collapse into one follow-up
//! - **Self-protecting**: A circuit breaker stops hammering a failing ledger
//! - **Lossless**: Records that fail to decrypt are kept as placeholders
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatsync_core::Identity;
//! use chatsync_crypto::ChaChaBox;
//! use chatsync_store::MemoryStore;
//! use chatsync_sync::{EngineParts, MemoryLedger, SyncConfig, SyncEngine};
//!
//! async fn example() {
//!     let parts = EngineParts {
//!         identity: Identity::generate(),
//!         store: Arc::new(MemoryStore::new()),
//!         ledger: Arc::new(MemoryLedger::new()),
//!         crypto: Arc::new(ChaChaBox::new()),
//!         push: None,
//!     };
//!     let engine = SyncEngine::open(parts, SyncConfig::default()).await.unwrap();
//!     engine.register_chat("general".into()).await;
//!     engine.start().await;
//! }
//! ```
//!
//! ## Breaker
//!
//! ```text
//! CLOSED --5 failures--> OPEN --60s--> HALF_OPEN --success--> CLOSED
//!                          ^               |
//!                          +----failure----+
//! ```

pub mod breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod transport;

pub use breaker::{Backoff, ChannelHealth, CircuitBreaker, CircuitState};
pub use config::{BackoffConfig, BreakerConfig, PushConfig, SyncConfig};
pub use engine::{ChatLocks, EngineHealth, EngineParts, SyncEngine};
pub use error::{Result, SyncError};
pub use events::{CycleReport, SyncEvent};
pub use ledger::{memory::MemoryLedger, Ledger, LedgerRecord, TransactionId};
pub use transport::{
    event_names, memory::MemoryPushHub, select_transport, wire, ChannelEvent, EventHandler,
    PullChannel, PushChannel, PushSocket, SocketFrame, TransportChannel, TransportKind,
    TransportMode,
};
