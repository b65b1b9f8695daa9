//! # Contract Events
//!
//! Every observable state change emits an [`Event`] into the runtime's
//! [`EventLog`]. The log is append-only from the outside, but a transition
//! that aborts (a rejected transfer hook, a failed continuation) truncates it
//! back to the checkpoint taken when the transition began. Observers never
//! see events for state that doesn't exist.
//!
//! Each record is also mirrored to `tracing` at debug level.

use chrono::{DateTime, Utc};
use cloak_protocol::commitment::Commitment;
use cloak_protocol::{Address, CiphertextHandle, EncryptedU64, RequestId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::correlator::RequestPurpose;
use crate::vault::WithdrawStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// Base asset escrowed and confidential units minted to `owner`.
    Wrapped {
        ledger: Address,
        owner: Address,
        amount: Commitment,
    },
    /// An unwrap's burned amount was decrypted and is claimable by `to`.
    Unwrapped {
        ledger: Address,
        owner: Address,
        to: Address,
        amount: Commitment,
        request_id: RequestId,
    },
    OperatorSet {
        ledger: Address,
        owner: Address,
        spender: Address,
        expiry: DateTime<Utc>,
    },
    OperatorRevoked {
        ledger: Address,
        owner: Address,
        spender: Address,
    },
    Transfer {
        ledger: Address,
        from: Address,
        to: Address,
        amount: EncryptedU64,
    },
    Deposited {
        vault: Address,
        owner: Address,
        shares: EncryptedU64,
    },
    WithdrawRequested {
        vault: Address,
        owner: Address,
        request_id: RequestId,
    },
    WithdrawResolved {
        vault: Address,
        request_id: RequestId,
        outcome: WithdrawStatus,
    },
    DecryptionRequested {
        requester: Address,
        request_id: RequestId,
        handle: CiphertextHandle,
        purpose: RequestPurpose,
    },
    DecryptionExpired {
        requester: Address,
        request_id: RequestId,
    },
    AmountDisclosed {
        ledger: Address,
        handle: CiphertextHandle,
        value: u64,
    },
}

/// An event with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// 1-based, dense. Rolled-back sequence numbers are reused.
    pub sequence: u64,
    pub at: DateTime<Utc>,
    pub event: Event,
}

/// Opaque marker returned by [`EventLog::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Debug, Default)]
pub struct EventLog {
    records: Vec<EventRecord>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, at: DateTime<Utc>, event: Event) -> u64 {
        let sequence = self.records.len() as u64 + 1;
        debug!(sequence, event = ?event, "event");
        self.records.push(EventRecord {
            sequence,
            at,
            event,
        });
        sequence
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.records.len())
    }

    /// Drop everything emitted after `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        if self.records.len() > checkpoint.0 {
            debug!(
                dropped = self.records.len() - checkpoint.0,
                "rolling back events"
            );
            self.records.truncate(checkpoint.0);
        }
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Up to `limit` records with sequence greater than `after`.
    pub fn since(&self, after: u64, limit: usize) -> Vec<EventRecord> {
        let start = (after as usize).min(self.records.len());
        self.records[start..].iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
