// Copyright (c) 2026 Cloak Contributors. MIT License.
// See LICENSE for details.

//! # Cloak Protocol: Core Library
//!
//! The primitives under Cloak's confidential ledger and vault: things that
//! know how to keep a number secret while still letting contracts add,
//! compare, and move it around.
//!
//! The rule everything here serves is simple: contract logic never sees a
//! plaintext balance. It holds opaque handles, asks the store to combine
//! them, and when it truly needs a plaintext it asks a trusted responder and
//! waits for a signed, commitment-checked answer.
//!
//! ## Architecture
//!
//! - **config**: Protocol constants, domain separators, limits.
//! - **crypto**: Ed25519 keys, AES-256-GCM sealing, BLAKE3, X25519 re-encryption.
//! - **commitment**: Pedersen commitments on BN254/G1.
//! - **ciphertext**: Handles, the ciphertext store, and its access list.
//! - **oracle**: Decryption request ids, resolutions, the trusted responder.
//! - **identity**: 20-byte account addresses.
//! - **clock**: The time source expiry checks read from.
//!
//! ## Design Philosophy
//!
//! 1. Types over conventions. An `EncryptedBool` is not an `EncryptedU64`.
//! 2. No plaintext getters. If you want a value, request a decryption.
//! 3. Boring cryptography, thinly wrapped.

pub mod ciphertext;
pub mod clock;
pub mod commitment;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod oracle;

pub use ciphertext::{CiphertextHandle, CiphertextStore, EncryptedBool, EncryptedU64, StoreError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::Address;
pub use oracle::{RequestId, Resolution, TrustedResponder};
