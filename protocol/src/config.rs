//! # Protocol Configuration & Constants
//!
//! Every magic number in Cloak lives here. Domain separators, key lengths,
//! timeouts, and size limits are defined once and referenced everywhere else.
//!
//! Domain separators in particular are consensus-critical: a handle derived
//! under one tag must never collide with an id derived under another, and an
//! attestation signed for one purpose must never verify for a different one.
//! Change them and every existing handle and attestation becomes garbage.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The full protocol version string.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Protocol fingerprint. Bound into every attestation so that responders for
/// an incompatible protocol generation cannot produce acceptable signatures.
pub const PROTOCOL_FINGERPRINT: &str = "CLOAK-CONFIDENTIAL-2026";

// ---------------------------------------------------------------------------
// Domain Separation
// ---------------------------------------------------------------------------

/// BLAKE3 derive-key context for ciphertext handles.
pub const HANDLE_DOMAIN: &str = "cloak 2026 ciphertext handle v1";

/// BLAKE3 derive-key context for decryption request ids.
pub const REQUEST_ID_DOMAIN: &str = "cloak 2026 decryption request id v1";

/// BLAKE3 derive-key context for deterministic contract addresses.
pub const ADDRESS_DOMAIN: &str = "cloak 2026 account address v1";

/// BLAKE3 derive-key context for re-encryption session keys.
pub const REENCRYPTION_KDF_CONTEXT: &str = "cloak 2026 reencryption session key v1";

/// Prefix of every message signed by the trusted decryption responder.
pub const ATTESTATION_DOMAIN: &[u8] = b"CLOAK/decryption-attestation/v1";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Ed25519 signature length. Responder attestations are always 64 bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 / X25519 public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// AES-256-GCM key length in bytes (the network key).
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. Twelve. Always twelve.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Length of a ciphertext handle in bytes. The final byte carries the kind tag.
pub const HANDLE_LENGTH: usize = 32;

/// Length of a decryption request id in bytes (256 bits of BLAKE3 output).
pub const REQUEST_ID_LENGTH: usize = 32;

/// Length of an account address in bytes.
pub const ADDRESS_LENGTH: usize = 20;

/// Length of a compressed BN254 scalar (commitment blinding factor).
pub const BLINDING_LENGTH: usize = 32;

/// Plaintext layout of a sealed opening: `value (u64 LE) || blinding (Fr)`.
pub const SEALED_OPENING_PLAINTEXT_LENGTH: usize = 8 + BLINDING_LENGTH;

// ---------------------------------------------------------------------------
// Timing Constants
// ---------------------------------------------------------------------------

/// How long a decryption request may stay pending before it expires and its
/// suspended operation is rolled back.
pub const DEFAULT_DECRYPTION_TIMEOUT: Duration = Duration::from_secs(300);

/// How often the gateway sweeps for expired decryption requests.
pub const DEFAULT_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum auxiliary data forwarded to a transfer receiver.
pub const MAX_CALLBACK_DATA_LEN: usize = 4096;

/// Maximum decimal places a confidential token may declare. Encrypted
/// amounts are 64-bit, so more precision than this leaves no headroom.
pub const MAX_CONFIDENTIAL_DECIMALS: u8 = 9;

/// Default decimals of a wrapped confidential token.
pub const DEFAULT_CONFIDENTIAL_DECIMALS: u8 = 6;

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Default HTTP port for the gateway API.
pub const DEFAULT_API_PORT: u16 = 9841;

/// Default port for the Prometheus metrics endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9842;

/// Maximum number of events returned by a single `/events` page.
pub const MAX_EVENTS_PER_PAGE: usize = 512;
