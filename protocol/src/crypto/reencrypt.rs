//! # Re-encryption for Access Control
//!
//! The ciphertext store never hands plaintext to core logic, but a user who
//! is on a handle's access list is entitled to learn its value. Re-encryption
//! is how: the store seals the value to the user's X25519 public key, and
//! only the user's secret key can open it.
//!
//! ## Protocol Flow
//!
//! 1. The user holds a long-lived [`ReencryptionKey`] and publishes its
//!    public half with the request.
//! 2. The store generates an ephemeral X25519 keypair, computes the shared
//!    secret with the user's key, and derives a one-shot AES-256 key via
//!    BLAKE3 `derive_key` (the raw DH output is never used directly).
//! 3. The value is sealed with the handle as associated data, and the
//!    ephemeral public key travels alongside the sealed box.
//! 4. The user repeats the DH with their secret and opens the box.
//!
//! The ephemeral secret is dropped after step 3, so compromising the store
//! later does not reveal past re-encryptions.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use super::encryption::{open, seal, EncryptionError, SealedBox};
use crate::ciphertext::handle::CiphertextHandle;
use crate::config::{AES_KEY_LENGTH, PUBLIC_KEY_LENGTH, REENCRYPTION_KDF_CONTEXT};

/// Errors in the re-encryption exchange.
#[derive(Debug, Error)]
pub enum ReencryptionError {
    #[error("re-encryption failed: {0}")]
    Sealing(#[from] EncryptionError),

    #[error("re-encrypted payload has the wrong length")]
    MalformedPayload,
}

/// A user's X25519 keypair for receiving re-encrypted values.
pub struct ReencryptionKey {
    secret: StaticSecret,
}

/// A value sealed to a specific user's [`ReencryptionKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReencryptedValue {
    /// The handle this value belongs to (authenticated as AAD).
    pub handle: CiphertextHandle,
    /// The store's ephemeral X25519 public key.
    #[serde(with = "hex_key")]
    pub ephemeral_public: [u8; PUBLIC_KEY_LENGTH],
    /// The sealed little-endian value.
    pub sealed: SealedBox,
}

impl ReencryptionKey {
    /// Generate a fresh key.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Deterministic key from a seed. Tests and wallets with their own KDF.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(seed),
        }
    }

    /// The public half, sent with re-encryption requests.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        PublicKey::from(&self.secret).to_bytes()
    }

    /// Open a value that was sealed to this key.
    pub fn open(&self, value: &ReencryptedValue) -> Result<u64, ReencryptionError> {
        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(value.ephemeral_public));
        let key = session_key(shared.as_bytes(), &value.ephemeral_public);
        let plaintext = open(&key, &value.sealed, value.handle.as_bytes())?;
        let bytes: [u8; 8] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| ReencryptionError::MalformedPayload)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Seal `value` for the holder of `recipient`. Called by the store only.
pub(crate) fn seal_for(
    recipient: &[u8; PUBLIC_KEY_LENGTH],
    handle: CiphertextHandle,
    value: u64,
) -> Result<ReencryptedValue, ReencryptionError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient));
    let key = session_key(shared.as_bytes(), &ephemeral_public);
    let sealed = seal(&key, &value.to_le_bytes(), handle.as_bytes())?;
    Ok(ReencryptedValue {
        handle,
        ephemeral_public,
        sealed,
    })
}

/// BLAKE3 KDF over `shared || ephemeral_public`.
fn session_key(shared: &[u8; 32], ephemeral_public: &[u8; 32]) -> [u8; AES_KEY_LENGTH] {
    let mut hasher = blake3::Hasher::new_derive_key(REENCRYPTION_KDF_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral_public);
    *hasher.finalize().as_bytes()
}

mod hex_key {
    use super::PUBLIC_KEY_LENGTH;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; PUBLIC_KEY_LENGTH], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; PUBLIC_KEY_LENGTH], D::Error> {
        let raw = hex::decode(String::deserialize(d)?).map_err(serde::de::Error::custom)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("key must be 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ciphertext::handle::ValueKind;

    fn handle(tag: u8) -> CiphertextHandle {
        CiphertextHandle::from_parts([tag; 31], ValueKind::U64)
    }

    #[test]
    fn recipient_can_open() {
        let user = ReencryptionKey::generate();
        let sealed = seal_for(&user.public_key(), handle(1), 1_000).unwrap();
        assert_eq!(user.open(&sealed).unwrap(), 1_000);
    }

    #[test]
    fn other_user_cannot_open() {
        let alice = ReencryptionKey::generate();
        let mallory = ReencryptionKey::generate();
        let sealed = seal_for(&alice.public_key(), handle(1), 42).unwrap();
        assert!(mallory.open(&sealed).is_err());
    }

    #[test]
    fn relabelled_handle_fails() {
        let user = ReencryptionKey::generate();
        let mut sealed = seal_for(&user.public_key(), handle(1), 42).unwrap();
        sealed.handle = handle(2);
        assert!(user.open(&sealed).is_err());
    }

    #[test]
    fn ephemeral_keys_differ_per_call() {
        let user = ReencryptionKey::from_seed([3u8; 32]);
        let a = seal_for(&user.public_key(), handle(1), 5).unwrap();
        let b = seal_for(&user.public_key(), handle(1), 5).unwrap();
        assert_ne!(a.ephemeral_public, b.ephemeral_public);
    }
}
