//! # Ciphertext Handle Store
//!
//! Opaque handles to encrypted values, the homomorphic operations over them,
//! and the access list that decides who may use or decrypt which handle.
//!
//! - [`handle`] -- `CiphertextHandle`, `EncryptedU64`, `EncryptedBool`
//! - [`store`] -- the coprocessor: records, operations, re-encryption
//! - [`acl`] -- per-handle access grants

pub mod acl;
pub mod handle;
pub mod store;

pub use handle::{CiphertextHandle, EncryptedBool, EncryptedU64, HandleError, ValueKind};
pub use store::{Ciphertext, CiphertextStore, StoreCheckpoint, StoreError};
