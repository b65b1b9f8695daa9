//! # Transfer Notification
//!
//! A confidential transfer to an account that hosts a
//! [`ConfidentialReceiver`] runs the receiver's hook synchronously, inside
//! the same atomic unit as the balance update. If the hook rejects or
//! errors, the ledger restores both balances, drops every event the
//! transfer emitted, and rolls the ciphertext store back, so records the
//! hook created and grants it made through `ctx` disappear too.
//!
//! Rules for implementors:
//!
//! 1. Check `caller`. It is the ledger that performed the transfer, and the
//!    only thing that proves the notice is real. Anyone can call a hook
//!    directly with a made-up notice.
//! 2. Returning [`Acceptance::Reject`] or `Err` must leave the receiver's
//!    own fields exactly as they were. The runtime rolls back the store and
//!    the event log, but it cannot see inside the receiver. Compute the new
//!    state into locals, decide, and write your fields only on the path that
//!    returns [`Acceptance::Accept`].

use chrono::{DateTime, Utc};
use cloak_protocol::{Address, CiphertextStore, EncryptedU64, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::events::{Event, EventLog};

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("untrusted caller {actual}: only {expected} may notify this receiver")]
    UntrustedCaller { expected: Address, actual: Address },

    #[error("transfer notice addressed to {actual}, but this receiver is {expected}")]
    MisdirectedTransfer { expected: Address, actual: Address },

    #[error("malformed callback data ({len} bytes)")]
    MalformedData { len: usize },

    #[error("receiver rejected the transfer: {0}")]
    Rejected(String),

    #[error("store error in receiver: {0}")]
    Store(#[from] StoreError),
}

/// The hook's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acceptance {
    Accept,
    Reject,
}

/// What the ledger tells a receiver about an incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferNotice {
    /// Who initiated the transfer (the owner, or an operator acting for them).
    pub operator: Address,
    pub from: Address,
    pub to: Address,
    /// The amount actually moved. Encrypted zero when `from` was short.
    pub amount: EncryptedU64,
    /// Opaque caller-supplied bytes.
    #[serde(with = "hex_data")]
    pub data: Vec<u8>,
}

/// Mutable world state a contract may touch during one transition.
pub struct ExecutionContext<'a> {
    pub store: &'a mut CiphertextStore,
    pub events: &'a mut EventLog,
    pub now: DateTime<Utc>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        store: &'a mut CiphertextStore,
        events: &'a mut EventLog,
        now: DateTime<Utc>,
    ) -> Self {
        Self { store, events, now }
    }

    pub fn emit(&mut self, event: Event) -> u64 {
        self.events.emit(self.now, event)
    }
}

pub trait ConfidentialReceiver: Send {
    /// The address this receiver is registered under.
    fn address(&self) -> Address;

    /// Called by the ledger after `notice.amount` has been credited to
    /// `notice.to`. Store and event changes made through `ctx` are undone if
    /// this returns anything but `Ok(Accept)`; changes to `self` are not, so
    /// an implementation must not mutate itself on those paths.
    fn on_confidential_transfer_received(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        caller: Address,
        notice: &TransferNotice,
    ) -> Result<Acceptance, ReceiverError>;
}

/// Lookup of hook-bearing accounts, handed to the ledger for one transfer.
pub trait ReceiverRegistry {
    fn receiver_mut(
        &mut self,
        address: &Address,
    ) -> Option<&mut (dyn ConfidentialReceiver + 'static)>;
}

impl ReceiverRegistry for BTreeMap<Address, Box<dyn ConfidentialReceiver>> {
    fn receiver_mut(
        &mut self,
        address: &Address,
    ) -> Option<&mut (dyn ConfidentialReceiver + 'static)> {
        self.get_mut(address).map(|receiver| receiver.as_mut())
    }
}

/// A registry with nobody in it.
pub struct NoReceivers;

impl ReceiverRegistry for NoReceivers {
    fn receiver_mut(
        &mut self,
        _address: &Address,
    ) -> Option<&mut (dyn ConfidentialReceiver + 'static)> {
        None
    }
}

mod hex_data {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloak_protocol::crypto::NetworkKey;

    struct Counter {
        address: Address,
        trusted: Address,
        accepted: u32,
    }

    impl ConfidentialReceiver for Counter {
        fn address(&self) -> Address {
            self.address
        }

        fn on_confidential_transfer_received(
            &mut self,
            _ctx: &mut ExecutionContext<'_>,
            caller: Address,
            _notice: &TransferNotice,
        ) -> Result<Acceptance, ReceiverError> {
            if caller != self.trusted {
                return Err(ReceiverError::UntrustedCaller {
                    expected: self.trusted,
                    actual: caller,
                });
            }
            self.accepted += 1;
            Ok(Acceptance::Accept)
        }
    }

    #[test]
    fn boxed_registry_dispatches_by_address() {
        let mut store = CiphertextStore::new(NetworkKey::generate());
        let mut events = EventLog::new();
        let amount = store.encrypt(1).unwrap();
        let ledger = Address::derive("ledger");
        let target = Address::derive("counter");

        let mut registry: BTreeMap<Address, Box<dyn ConfidentialReceiver>> = BTreeMap::new();
        registry.insert(
            target,
            Box::new(Counter {
                address: target,
                trusted: ledger,
                accepted: 0,
            }),
        );

        let notice = TransferNotice {
            operator: Address::derive("alice"),
            from: Address::derive("alice"),
            to: target,
            amount,
            data: vec![],
        };
        let mut ctx = ExecutionContext::new(&mut store, &mut events, Utc::now());

        let hook = registry.receiver_mut(&target).unwrap();
        assert_eq!(
            hook.on_confidential_transfer_received(&mut ctx, ledger, &notice)
                .unwrap(),
            Acceptance::Accept
        );
        assert!(matches!(
            hook.on_confidential_transfer_received(&mut ctx, Address::derive("mallory"), &notice),
            Err(ReceiverError::UntrustedCaller { .. })
        ));

        assert!(registry.receiver_mut(&Address::derive("nobody")).is_none());
        assert!(NoReceivers.receiver_mut(&target).is_none());
    }

    #[test]
    fn notice_data_is_hex_in_json() {
        let mut store = CiphertextStore::new(NetworkKey::generate());
        let notice = TransferNotice {
            operator: Address::ZERO,
            from: Address::ZERO,
            to: Address::ZERO,
            amount: store.encrypt(0).unwrap(),
            data: vec![0xde, 0xad],
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["data"], "dead");
        let back: TransferNotice = serde_json::from_value(json).unwrap();
        assert_eq!(back, notice);
    }
}
