//! # Attested Decryption
//!
//! Contracts that need a plaintext (is this withdrawal covered? how much was
//! burned?) submit a decryption request and suspend. Some time later a
//! trusted responder, the only party besides the store holding the network
//! key, answers with a [`Resolution`]:
//!
//! ```text
//! request_id, plaintext, blinding, sig_responder(
//!     ATTESTATION_DOMAIN || FINGERPRINT || request_id || handle || plaintext || blinding)
//! ```
//!
//! The signature ties the answer to one request and one handle, so it can't
//! be replayed elsewhere. The blinding lets the verifier recompute the
//! handle's Pedersen commitment, so even a compromised signing key cannot
//! attest to a value the handle doesn't hold.
//!
//! Verification itself lives in the contracts crate (the correlator); this
//! module defines the wire types and the responder.

use ark_bn254::Fr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::ciphertext::store::decode_opening;
use crate::ciphertext::{CiphertextHandle, CiphertextStore, StoreError};
use crate::commitment::{blinding_from_bytes, blinding_to_bytes, CommitmentError};
use crate::config::{
    ATTESTATION_DOMAIN, BLINDING_LENGTH, PROTOCOL_FINGERPRINT, REQUEST_ID_LENGTH,
};
use crate::crypto::encryption::{open, EncryptionError, NetworkKey};
use crate::crypto::keys::{CloakKeypair, CloakPublicKey, CloakSignature};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cannot open ciphertext: {0}")]
    Sealing(#[from] EncryptionError),

    #[error("sealed opening for {0} is corrupt")]
    CorruptOpening(CiphertextHandle),

    #[error("invalid request id encoding")]
    MalformedRequestId,
}

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// 256-bit identifier of a decryption request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId([u8; REQUEST_ID_LENGTH]);

impl RequestId {
    pub fn from_bytes(bytes: [u8; REQUEST_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, OracleError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let raw = hex::decode(s).map_err(|_| OracleError::MalformedRequestId)?;
        let bytes: [u8; REQUEST_ID_LENGTH] = raw
            .as_slice()
            .try_into()
            .map_err(|_| OracleError::MalformedRequestId)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// A responder's answer to one decryption request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub request_id: RequestId,
    pub plaintext: u64,
    /// The commitment blinding, little-endian, hex in JSON.
    #[serde(with = "hex_blinding")]
    pub blinding: [u8; BLINDING_LENGTH],
    pub attestation: CloakSignature,
}

impl Resolution {
    pub fn blinding_scalar(&self) -> Result<Fr, CommitmentError> {
        blinding_from_bytes(&self.blinding)
    }

    /// The exact bytes the attestation must cover, given the request's handle.
    pub fn signed_message(&self, handle: &CiphertextHandle) -> Vec<u8> {
        attestation_message(&self.request_id, handle, self.plaintext, &self.blinding)
    }
}

/// `ATTESTATION_DOMAIN || FINGERPRINT || request_id || handle || plaintext LE || blinding`.
pub fn attestation_message(
    request_id: &RequestId,
    handle: &CiphertextHandle,
    plaintext: u64,
    blinding: &[u8; BLINDING_LENGTH],
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ATTESTATION_DOMAIN.len() + PROTOCOL_FINGERPRINT.len() + 104);
    msg.extend_from_slice(ATTESTATION_DOMAIN);
    msg.extend_from_slice(PROTOCOL_FINGERPRINT.as_bytes());
    msg.extend_from_slice(request_id.as_bytes());
    msg.extend_from_slice(handle.as_bytes());
    msg.extend_from_slice(&plaintext.to_le_bytes());
    msg.extend_from_slice(blinding);
    msg
}

// ---------------------------------------------------------------------------
// TrustedResponder
// ---------------------------------------------------------------------------

/// The key-management side: opens ciphertexts and signs what it finds.
///
/// Runs outside contract logic (a gateway worker, or a test harness). Doubles
/// as the test decrypt oracle via [`decrypt`](Self::decrypt).
pub struct TrustedResponder {
    keypair: CloakKeypair,
    network_key: NetworkKey,
}

impl TrustedResponder {
    pub fn new(keypair: CloakKeypair, network_key: NetworkKey) -> Self {
        Self {
            keypair,
            network_key,
        }
    }

    /// The key contracts pin at deployment.
    pub fn public_key(&self) -> CloakPublicKey {
        self.keypair.public_key()
    }

    /// Decrypt `handle` and attest to the result for `request_id`.
    pub fn respond(
        &self,
        store: &CiphertextStore,
        request_id: RequestId,
        handle: CiphertextHandle,
    ) -> Result<Resolution, OracleError> {
        let (plaintext, blinding) = self.open(store, handle)?;
        let blinding = blinding_to_bytes(&blinding);
        let attestation = self.keypair.sign(&attestation_message(
            &request_id,
            &handle,
            plaintext,
            &blinding,
        ));
        Ok(Resolution {
            request_id,
            plaintext,
            blinding,
            attestation,
        })
    }

    /// Sign an arbitrary claim. Exists so tests can build well-signed
    /// resolutions that lie about the plaintext.
    pub fn sign_claim(
        &self,
        request_id: RequestId,
        handle: &CiphertextHandle,
        plaintext: u64,
        blinding: [u8; BLINDING_LENGTH],
    ) -> Resolution {
        let attestation =
            self.keypair
                .sign(&attestation_message(&request_id, handle, plaintext, &blinding));
        Resolution {
            request_id,
            plaintext,
            blinding,
            attestation,
        }
    }

    /// Plain decryption with no attestation.
    pub fn decrypt(
        &self,
        store: &CiphertextStore,
        handle: impl Into<CiphertextHandle>,
    ) -> Result<u64, OracleError> {
        Ok(self.open(store, handle.into())?.0)
    }

    fn open(
        &self,
        store: &CiphertextStore,
        handle: CiphertextHandle,
    ) -> Result<(u64, Fr), OracleError> {
        let ct = store
            .ciphertext(&handle)
            .ok_or(StoreError::UnknownHandle(handle))?;
        let plaintext = open(self.network_key.as_bytes(), &ct.sealed, handle.as_bytes())?;
        decode_opening(&plaintext).ok_or(OracleError::CorruptOpening(handle))
    }
}

mod hex_blinding {
    use super::BLINDING_LENGTH;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; BLINDING_LENGTH], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; BLINDING_LENGTH], D::Error> {
        let raw = hex::decode(String::deserialize(d)?).map_err(serde::de::Error::custom)?;
        raw.as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("blinding must be 32 bytes"))
    }
}
