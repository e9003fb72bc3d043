//! Ledger collaborator: the remote, append-only source of truth.
//!
//! The ledger only ever sees sealed records. Query results are treated as
//! a delta to merge into local state, never as an authoritative overwrite.

use async_trait::async_trait;
use bytes::Bytes;
use chatsync_core::{ChatId, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Ledger transaction identifier.
pub type TransactionId = String;

/// One sealed record as stored on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub ciphertext: Bytes,
    pub nonce: Nonce,
    pub sender_commitment: String,
    /// Sender wall-clock time (Unix ms).
    pub timestamp: i64,
}

/// Remote ledger interface.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append a sealed record to a chat. May fail; callers never roll back
    /// local state on failure.
    async fn submit(&self, chat_id: &ChatId, record: &LedgerRecord) -> Result<TransactionId>;

    /// All records of a chat.
    async fn query(&self, chat_id: &ChatId) -> Result<Vec<LedgerRecord>>;
}

/// An in-memory ledger for tests and local simulations.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::RwLock;

    use crate::error::SyncError;

    /// Shared in-memory ledger with failure and latency injection.
    #[derive(Default)]
    pub struct MemoryLedger {
        records: RwLock<HashMap<ChatId, Vec<LedgerRecord>>>,
        offline: AtomicBool,
        fail_next: AtomicU32,
        latency: RwLock<Option<Duration>>,
        queries: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        next_tx: AtomicUsize,
    }

    impl MemoryLedger {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every call fails while offline.
        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        /// Fail the next `n` calls.
        pub fn fail_next(&self, n: u32) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        /// Delay every call by `latency`.
        pub async fn set_latency(&self, latency: Option<Duration>) {
            *self.latency.write().await = latency;
        }

        /// Number of queries attempted so far, failed ones included.
        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }

        /// Highest number of queries that were ever running at once.
        pub fn max_concurrent_queries(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        /// Append a record directly, bypassing failure injection.
        pub async fn insert(&self, chat_id: &ChatId, record: LedgerRecord) {
            self.records
                .write()
                .await
                .entry(chat_id.clone())
                .or_default()
                .push(record);
        }

        pub async fn records(&self, chat_id: &ChatId) -> Vec<LedgerRecord> {
            self.records
                .read()
                .await
                .get(chat_id)
                .cloned()
                .unwrap_or_default()
        }

        async fn simulate(&self) -> Result<()> {
            if let Some(latency) = *self.latency.read().await {
                tokio::time::sleep(latency).await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::Fetch("ledger offline".into()));
            }
            let injected = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(SyncError::Fetch("injected failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Ledger for MemoryLedger {
        async fn submit(&self, chat_id: &ChatId, record: &LedgerRecord) -> Result<TransactionId> {
            self.simulate().await?;
            self.insert(chat_id, record.clone()).await;
            let n = self.next_tx.fetch_add(1, Ordering::SeqCst);
            Ok(format!("tx-{}", n))
        }

        async fn query(&self, chat_id: &ChatId) -> Result<Vec<LedgerRecord>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = self.simulate().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result?;
            Ok(self.records(chat_id).await)
        }
    }
}
