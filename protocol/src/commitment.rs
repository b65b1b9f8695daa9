//! # Pedersen Commitments over BN254
//!
//! Every ciphertext in the store carries a Pedersen commitment to its value:
//!
//! ```text
//! C = v * G + r * H          (on BN254/G1)
//! ```
//!
//! The commitment is public; the opening `(v, r)` is sealed under the network
//! key. Two properties make this useful:
//!
//! - **Binding**: a responder claiming that handle `h` decrypts to `v` must
//!   also reveal an `r` with `commit(v, r) == C_h`. It cannot substitute a
//!   different value without solving DLOG on G1.
//! - **Homomorphism**: `C1 + C2` commits to `v1 + v2` under `r1 + r2`. Ledger
//!   additions and subtractions combine commitments directly instead of
//!   recommitting, as long as the result stays inside `u64`.

use ark_bn254::{Fr, G1Affine, G1Projective};
use ark_ec::{AffineRepr, CurveGroup};
use ark_ff::{BigInteger, PrimeField, UniformRand};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Mul;
use thiserror::Error;

use crate::config::BLINDING_LENGTH;

#[derive(Debug, Error)]
pub enum CommitmentError {
    #[error("blinding factor must be {BLINDING_LENGTH} bytes")]
    InvalidBlindingLength,

    #[error("blinding factor is not a canonical scalar")]
    NonCanonicalBlinding,

    #[error("commitment bytes do not encode a valid G1 point")]
    InvalidPoint,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Public generators for the commitment scheme.
///
/// Nobody may know `log_G(H)`. The store samples both at construction; a
/// production deployment would take them from a ceremony transcript.
#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
pub struct PedersenParams {
    /// Value generator.
    pub g: G1Affine,
    /// Blinding generator.
    pub h: G1Affine,
}

/// A Pedersen commitment point. Serialized as compressed hex.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Commitment {
    pub point: G1Affine,
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

impl PedersenParams {
    /// Sample fresh generators.
    pub fn setup<R: Rng>(rng: &mut R) -> Self {
        // BN254/G1 has prime order, so any non-identity point generates it.
        let g = G1Projective::rand(rng).into_affine();
        let h = G1Projective::rand(rng).into_affine();

        debug_assert!(!g.is_zero(), "generator g must not be identity");
        debug_assert!(!h.is_zero(), "generator h must not be identity");

        Self { g, h }
    }
}

// ---------------------------------------------------------------------------
// Commit / Verify
// ---------------------------------------------------------------------------

/// `C = value * G + blinding * H`.
pub fn commit(params: &PedersenParams, value: u64, blinding: Fr) -> Commitment {
    let v = Fr::from(value);
    let point = (params.g.mul(v) + params.h.mul(blinding)).into_affine();
    Commitment { point }
}

/// Check that `commitment` opens to `(value, blinding)`.
///
/// Not zero-knowledge: the opening is revealed. Only the decryption
/// correlator calls this, on openings that are about to become public anyway.
pub fn verify_commitment(
    params: &PedersenParams,
    commitment: &Commitment,
    value: u64,
    blinding: Fr,
) -> bool {
    commit(params, value, blinding) == *commitment
}

/// A uniformly random blinding factor.
pub fn random_blinding<R: Rng>(rng: &mut R) -> Fr {
    Fr::rand(rng)
}

// ---------------------------------------------------------------------------
// Homomorphic combination
// ---------------------------------------------------------------------------

impl Commitment {
    /// `C1 + C2`, a commitment to `v1 + v2` under `r1 + r2`.
    pub fn add(&self, other: &Commitment) -> Commitment {
        Commitment {
            point: (self.point.into_group() + other.point).into_affine(),
        }
    }

    /// `C1 - C2`, a commitment to `v1 - v2` under `r1 - r2`.
    pub fn sub(&self, other: &Commitment) -> Commitment {
        Commitment {
            point: (self.point.into_group() - other.point).into_affine(),
        }
    }

    /// Compressed point encoding (32 bytes).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        self.point
            .serialize_compressed(&mut buf)
            .expect("G1 serialization into a Vec cannot fail");
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CommitmentError> {
        let point =
            G1Affine::deserialize_compressed(data).map_err(|_| CommitmentError::InvalidPoint)?;
        Ok(Self { point })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", self.to_hex())
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Commitment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Commitment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Blinding encoding
// ---------------------------------------------------------------------------

/// Little-endian canonical encoding of a blinding scalar.
pub fn blinding_to_bytes(blinding: &Fr) -> [u8; BLINDING_LENGTH] {
    let mut out = [0u8; BLINDING_LENGTH];
    let le = blinding.into_bigint().to_bytes_le();
    out[..le.len()].copy_from_slice(&le);
    out
}

/// Parse a blinding scalar, rejecting non-canonical encodings (values >= r).
pub fn blinding_from_bytes(bytes: &[u8]) -> Result<Fr, CommitmentError> {
    if bytes.len() != BLINDING_LENGTH {
        return Err(CommitmentError::InvalidBlindingLength);
    }
    let scalar = Fr::from_le_bytes_mod_order(bytes);
    if blinding_to_bytes(&scalar)[..] != *bytes {
        return Err(CommitmentError::NonCanonicalBlinding);
    }
    Ok(scalar)
}
