//! The `CryptoBox` interface and its ChaCha20-Poly1305 key ring.

use async_trait::async_trait;
use chatsync_core::{ChatId, Identity, Nonce};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::keys::{ChatKey, Sealed, SharedKey, X25519PublicKey, X25519StaticSecret};

/// Symmetric encryption for chat content.
///
/// Decrypt must report authentication failure as
/// [`CryptoError::Authentication`](crate::CryptoError::Authentication) so
/// callers can keep the record as undecryptable instead of aborting.
#[async_trait]
pub trait CryptoBox: Send + Sync {
    /// Resolve the symmetric key for a chat.
    async fn derive_key(&self, chat_id: &ChatId, identity: &Identity) -> Result<ChatKey>;

    async fn encrypt(&self, plaintext: &[u8], key: &ChatKey) -> Result<Sealed>;

    async fn decrypt(&self, ciphertext: &[u8], nonce: &Nonce, key: &ChatKey) -> Result<Vec<u8>>;
}

/// Where a chat's secret comes from.
#[derive(Debug, Clone)]
enum KeySource {
    /// Secret provisioned out of band and shared by all members.
    Group(SharedKey),
    /// One-to-one chat keyed by X25519 agreement with the peer.
    Direct(X25519PublicKey),
}

/// Key ring backed by ChaCha20-Poly1305.
///
/// A chat with neither a group secret nor a direct peer is a note-to-self
/// chat and is keyed from the identity seed.
#[derive(Default)]
pub struct ChaChaBox {
    sources: RwLock<HashMap<ChatId, KeySource>>,
    cache: RwLock<HashMap<ChatId, ChatKey>>,
}

impl ChaChaBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a shared group secret for a chat.
    pub async fn set_group_secret(&self, chat_id: ChatId, secret: [u8; 32]) {
        self.sources
            .write()
            .await
            .insert(chat_id.clone(), KeySource::Group(SharedKey::from_bytes(secret)));
        self.cache.write().await.remove(&chat_id);
    }

    /// Register the X25519 public key of the peer in a direct chat.
    pub async fn set_direct_peer(&self, chat_id: ChatId, peer: X25519PublicKey) {
        self.sources
            .write()
            .await
            .insert(chat_id.clone(), KeySource::Direct(peer));
        self.cache.write().await.remove(&chat_id);
    }

    /// Our X25519 public key, to hand to direct-chat peers.
    pub fn agreement_public_key(identity: &Identity) -> X25519PublicKey {
        X25519StaticSecret::from_identity(identity).public_key()
    }
}

#[async_trait]
impl CryptoBox for ChaChaBox {
    async fn derive_key(&self, chat_id: &ChatId, identity: &Identity) -> Result<ChatKey> {
        if let Some(key) = self.cache.read().await.get(chat_id) {
            return Ok(key.clone());
        }

        let source = self.sources.read().await.get(chat_id).cloned();
        let secret = match source {
            Some(KeySource::Group(secret)) => secret,
            Some(KeySource::Direct(peer)) => {
                X25519StaticSecret::from_identity(identity).diffie_hellman(&peer)
            }
            None => {
                tracing::debug!(chat = %chat_id, "no key source, using self key");
                SharedKey::from_bytes(identity.seed())
            }
        };

        let key = secret.derive_chat_key(chat_id);
        self.cache.write().await.insert(chat_id.clone(), key.clone());
        Ok(key)
    }

    async fn encrypt(&self, plaintext: &[u8], key: &ChatKey) -> Result<Sealed> {
        key.seal(plaintext)
    }

    async fn decrypt(&self, ciphertext: &[u8], nonce: &Nonce, key: &ChatKey) -> Result<Vec<u8>> {
        key.open(ciphertext, nonce)
    }
}
