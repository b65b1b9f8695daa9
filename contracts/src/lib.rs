//! # Cloak Contracts
//!
//! Contract logic for Cloak's confidential asset and the lending vault that
//! sits on top of it. Nothing in here ever holds a plaintext balance; the
//! contracts juggle ciphertext handles and ask the store to do the math.
//!
//! - **Ledger**: wrap a plaintext base asset into encrypted balances, move
//!   them around, unwrap them back out.
//! - **Operators**: time-bounded delegation. No allowances, just "who" and
//!   "until when".
//! - **Receiver**: the transfer-notification hook that lets a transfer and
//!   its side effect commit or fail together.
//! - **Vault**: encrypted share positions, credited only by verified
//!   notifications from its ledger.
//! - **Correlator**: the request/response protocol for the rare moments a
//!   contract genuinely needs a plaintext.
//! - **Runtime**: the single-writer executor that composes all of it.
//!
//! ## Design Principles
//!
//! 1. Insufficient funds never fail a transfer. They transfer an encrypted
//!    zero, because a failure would be a plaintext comparison result.
//! 2. State transitions are explicit: enum variants, not boolean flags.
//! 3. Compute first, commit last. A failed operation leaves no trace.
//! 4. Every public type is serializable (serde) for the gateway.

pub mod base_asset;
pub mod correlator;
pub mod events;
pub mod ledger;
pub mod operators;
pub mod receiver;
pub mod runtime;
pub mod vault;

pub use base_asset::{BaseAsset, InMemoryBaseAsset};
pub use correlator::{CorrelatorError, DecryptionCorrelator, DecryptionRequest, RequestPurpose};
pub use events::{Event, EventLog, EventRecord};
pub use ledger::{ConfidentialLedger, LedgerError, LedgerSpec};
pub use operators::{OperatorGrant, OperatorRegistry};
pub use receiver::{Acceptance, ConfidentialReceiver, ExecutionContext, ReceiverError, TransferNotice};
pub use runtime::{Runtime, RuntimeConfig, RuntimeError};
pub use vault::{LendingVault, VaultError, WithdrawStatus};
