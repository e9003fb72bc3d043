//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur while moving data between transports, the ledger
/// and local storage.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Push channel failed its availability probe or exhausted reconnects.
    /// The session falls back to pull-only.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Transient push channel error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Ledger query or submit failed.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A bounded operation ran out of time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Sealed content could not be opened.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The circuit breaker is refusing fetch attempts.
    #[error("circuit breaker open")]
    BreakerOpen,

    /// Malformed payload on a transport.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("store error: {0}")]
    Store(#[from] chatsync_store::StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] chatsync_crypto::CryptoError),

    #[error("core error: {0}")]
    Core(#[from] chatsync_core::CoreError),
}

impl SyncError {
    /// Whether this error counts against the circuit breaker.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, SyncError::Fetch(_) | SyncError::Timeout(_))
    }

    /// Reclassify an error raised on the fetch path so it counts as a fetch
    /// failure whatever the ledger reported.
    pub fn into_fetch_failure(self) -> Self {
        if self.is_fetch_failure() {
            self
        } else {
            SyncError::Fetch(self.to_string())
        }
    }
}


/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
