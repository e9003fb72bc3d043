//! # chatsync crypto
//!
//! Chat keys and authenticated encryption.
//!
//! ## Key Model
//!
//! Every chat has one symmetric ChaCha20-Poly1305 key, derived with
//! `blake3::derive_key` from a chat secret and the chat id:
//!
//! 1. **Group chats**: the secret is provisioned out of band to all members
//! 2. **Direct chats**: the secret is the X25519 agreement between the two
//!    identities
//! 3. **Note-to-self**: the secret is the identity seed
//!
//! Derived keys are cached per chat by [`ChaChaBox`].

pub mod crypto_box;
pub mod error;
pub mod keys;

pub use crypto_box::{ChaChaBox, CryptoBox};
pub use error::{CryptoError, Result};
pub use keys::{ChatKey, Sealed, SharedKey, X25519PublicKey, X25519StaticSecret};
