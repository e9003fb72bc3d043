//! Key material: X25519 agreement and ChaCha20-Poly1305 chat keys.

use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305,
};
use chatsync_core::{ChatId, Identity, Nonce};
use rand::RngCore;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CryptoError, Result};

const X25519_DOMAIN: &str = "chatsync-v0 x25519 static secret";
const CHAT_KEY_DOMAIN: &str = "chatsync-v0 chat key";

/// An X25519 public key (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct X25519PublicKey(pub [u8; 32]);

impl X25519PublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(pk: PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

/// X25519 static secret bound to the device identity.
pub struct X25519StaticSecret(StaticSecret);

impl X25519StaticSecret {
    /// Derive the agreement secret from the identity seed, so one seed
    /// backs both signing and key agreement.
    pub fn from_identity(identity: &Identity) -> Self {
        let bytes = blake3::derive_key(X25519_DOMAIN, &identity.seed());
        Self(StaticSecret::from(bytes))
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(PublicKey::from(&self.0))
    }

    pub fn diffie_hellman(&self, peer_public: &X25519PublicKey) -> SharedKey {
        let shared = self.0.diffie_hellman(&peer_public.to_dalek());
        SharedKey(*shared.as_bytes())
    }
}

/// Raw shared secret from agreement or provisioning. Never used directly
/// as a cipher key.
#[derive(Clone)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Bind this secret to one chat.
    pub fn derive_chat_key(&self, chat_id: &ChatId) -> ChatKey {
        let mut hasher = blake3::Hasher::new_derive_key(CHAT_KEY_DOMAIN);
        hasher.update(&self.0);
        hasher.update(chat_id.as_str().as_bytes());
        ChatKey(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// A 256-bit ChaCha20-Poly1305 key for one chat.
#[derive(Clone, PartialEq, Eq)]
pub struct ChatKey([u8; 32]);

impl ChatKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encrypt under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed> {
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce = Nonce::from_bytes(nonce);

        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(nonce.as_bytes()), plaintext)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        Ok(Sealed {
            ciphertext: Bytes::from(ciphertext),
            nonce,
        })
    }

    /// Decrypt and authenticate. Any failure is reported as
    /// [`CryptoError::Authentication`].
    pub fn open(&self, ciphertext: &[u8], nonce: &Nonce) -> Result<Vec<u8>> {
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.0).map_err(|_| CryptoError::Authentication)?;
        cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce.as_bytes()), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}

impl fmt::Debug for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChatKey(..)")
    }
}

/// Ciphertext plus the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Bytes,
    pub nonce: Nonce,
}
