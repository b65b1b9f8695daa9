//! # AES-256-GCM Sealing
//!
//! Authenticated encryption for everything Cloak keeps secret at rest:
//! the openings `(value, blinding)` behind every ciphertext handle, and the
//! payloads of re-encrypted values handed to users.
//!
//! ## Nonce management
//!
//! Random 96-bit nonces from `OsRng`. The birthday bound is ~2^48 messages
//! per key, far beyond what a single network key will ever seal.
//!
//! ## Associated data
//!
//! Sealed openings always carry the handle as AAD. A sealed blob copied
//! under a different handle fails authentication instead of silently
//! decrypting to someone else's value.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH};

/// Errors that can occur during sealing/opening.
///
/// We don't distinguish "wrong key" from "tampered ciphertext" on purpose.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key, wrong associated data, or corrupted ciphertext")]
    DecryptFailed,

    #[error("invalid key length: expected {AES_KEY_LENGTH} bytes")]
    InvalidKeyLength,
}

/// The symmetric key under which ciphertext openings are sealed.
///
/// Held by exactly two parties: the ciphertext store (which evaluates
/// homomorphic operations inside its boundary) and the trusted responder
/// (which answers decryption requests). Core contract logic never sees it.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkKey {
    bytes: [u8; AES_KEY_LENGTH],
}

impl NetworkKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; AES_KEY_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Wrap existing key material.
    pub fn from_bytes(bytes: [u8; AES_KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    /// Parse a hex-encoded key (e.g. from the environment).
    pub fn from_hex(hex_str: &str) -> Result<Self, EncryptionError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| EncryptionError::InvalidKeyLength)?;
        let arr: [u8; AES_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| EncryptionError::InvalidKeyLength)?;
        Ok(Self { bytes: arr })
    }

    /// Hex-encoded key. Only `keygen` should ever call this.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.bytes
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(<redacted>)")
    }
}

/// A nonce plus AES-GCM ciphertext (tag appended).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Random 96-bit nonce.
    #[serde(with = "hex_nonce")]
    pub nonce: [u8; AES_NONCE_LENGTH],
    /// Ciphertext with the 16-byte authentication tag appended.
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedBox({} bytes)", self.ciphertext.len())
    }
}

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
pub fn seal(
    key: &[u8; AES_KEY_LENGTH],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<SealedBox, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::EncryptFailed)?;

    let mut nonce = [0u8; AES_NONCE_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::EncryptFailed)?;

    Ok(SealedBox { nonce, ciphertext })
}

/// Decrypt a [`SealedBox`]. The same `aad` used at sealing time is required.
pub fn open(
    key: &[u8; AES_KEY_LENGTH],
    sealed: &SealedBox,
    aad: &[u8],
) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::DecryptFailed)?;
    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad,
            },
        )
        .map_err(|_| EncryptionError::DecryptFailed)
}

mod hex_nonce {
    use super::AES_NONCE_LENGTH;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; AES_NONCE_LENGTH], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; AES_NONCE_LENGTH], D::Error> {
        let raw = hex::decode(String::deserialize(d)?).map_err(serde::de::Error::custom)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must be 12 bytes"))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        hex::decode(String::deserialize(d)?).map_err(serde::de::Error::custom)
    }
}
