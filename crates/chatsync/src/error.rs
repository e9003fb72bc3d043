//! Error types for the messenger.

use chatsync_core::{ChatId, CoreError, MessageId};
use chatsync_crypto::CryptoError;
use chatsync_store::StoreError;
use chatsync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during messenger operations.
///
/// Only local work can fail a call. Ledger and push delivery happen after
/// the call returns and report through the event stream instead.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// Status regression or retry of a message that has not failed.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("chat not found: {0}")]
    ChatNotFound(ChatId),

    /// The operation is not valid for this message or chat.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for messenger operations.
pub type Result<T> = std::result::Result<T, MessengerError>;
