//! Error types for the crypto layer.

use thiserror::Error;

/// Errors that can occur while deriving keys or sealing content.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Ciphertext failed AEAD authentication: wrong key or tampered data.
    #[error("authentication failed")]
    Authentication,

    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Key derivation error.
    #[error("key derivation error: {0}")]
    KeyDerivationError(String),

    /// Core error.
    #[error("core error: {0}")]
    CoreError(#[from] chatsync_core::CoreError),
}

impl CryptoError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, CryptoError::Authentication)
    }
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
