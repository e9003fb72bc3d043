//! Device identity.
//!
//! One identity per process. The Ed25519 public key names the node in
//! every logical clock and backs the sender commitment published on the
//! ledger.

use ed25519_dalek::SigningKey;
use rand::RngCore;
use std::fmt;

use crate::types::NodeId;

const COMMITMENT_DOMAIN: &[u8] = b"chatsync-commitment-v0";

/// The local device identity.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Node id used in Lamport stamps and vector clocks (hex public key).
    pub fn node_id(&self) -> NodeId {
        NodeId::new(hex::encode(self.public_key()))
    }

    /// Raw seed bytes (secret key material).
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Stable commitment to this identity.
    pub fn commitment(&self) -> String {
        self.commit(None)
    }

    /// Unlinkable commitment: a fresh salt is mixed in per call.
    pub fn anonymous_commitment(&self) -> String {
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        self.commit(Some(&salt))
    }

    fn commit(&self, salt: Option<&[u8; 32]>) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(COMMITMENT_DOMAIN);
        hasher.update(&self.public_key());
        if let Some(salt) = salt {
            hasher.update(salt);
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:?})", self.node_id())
    }
}
