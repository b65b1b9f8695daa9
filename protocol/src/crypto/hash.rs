//! # Hashing Utilities
//!
//! BLAKE3 everywhere. Identifiers (handles, request ids, contract addresses)
//! are produced with BLAKE3's `derive_key` mode so that each identifier family
//! lives in its own domain; see the `*_DOMAIN` constants in
//! [`crate::config`].

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Domain-separated BLAKE3 over a sequence of parts.
///
/// Each part is length-prefixed (u64 little-endian) before being absorbed,
/// so `["ab", "c"]` and `["a", "bc"]` hash differently.
pub fn derive(context: &str, parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}
