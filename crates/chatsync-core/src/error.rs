//! Error types for chatsync core.

use thiserror::Error;

use crate::message::DeliveryStatus;
use crate::types::MessageId;

/// Errors raised by the pure data model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A delivery status change that would move the message backwards.
    #[error("invalid delivery status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    /// Retry requested for a message that has not failed.
    #[error("message {0} is not in a failed state")]
    NotFailed(MessageId),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
