//! # Cryptographic Primitives for Cloak
//!
//! Everything secret in Cloak goes through here:
//!
//! - **Ed25519** for the responder's attestations.
//! - **AES-256-GCM** for sealing ciphertext openings under the network key.
//! - **X25519** for re-encrypting a value to one user's key.
//! - **BLAKE3** for handles, request ids, addresses, and key derivation.
//!
//! Thin, type-safe wrappers around audited crates. Nothing clever.

pub mod encryption;
pub mod hash;
pub mod keys;
pub mod reencrypt;

pub use encryption::{NetworkKey, SealedBox};
pub use hash::blake3_hash;
pub use keys::{CloakKeypair, CloakPublicKey, CloakSignature};
pub use reencrypt::{ReencryptedValue, ReencryptionKey};
