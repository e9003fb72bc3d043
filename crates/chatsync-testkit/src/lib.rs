//! # chatsync testkit
//!
//! Testing utilities for chatsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: A [`Network`] of nodes sharing one in-memory ledger and
//!   push hub, for multi-node scenarios
//! - **Generators**: Proptest strategies for messages, vector clocks and
//!   chat states
//!
//! ## Multi-node Scenarios
//!
//! ```rust,no_run
//! use chatsync_testkit::Network;
//!
//! async fn example() {
//!     let network = Network::new();
//!     let nodes = network.nodes(3).await.unwrap();
//!
//!     nodes[0].send("hello").await.unwrap();
//!     network.settle_all(&nodes).await;
//!     network.sync_all(&nodes).await.unwrap();
//!
//!     let first = nodes[0].transcript().await.unwrap();
//!     assert_eq!(first, nodes[2].transcript().await.unwrap());
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use chatsync_core::ConflictResolver;
//! use chatsync_testkit::generators::message_set;
//!
//! proptest! {
//!     #[test]
//!     fn merge_is_idempotent(a in message_set("c"), b in message_set("c")) {
//!         let resolver = ConflictResolver::new();
//!         let once = resolver.resolve_messages(&a, &b).merged;
//!         prop_assert_eq!(resolver.resolve_messages(&once, &b).merged, once);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{sealed_message, Network, Node, GROUP_CHAT, GROUP_SECRET};
pub use generators::{message_from_params, MessageParams};
