//! # Ciphertext Store
//!
//! The coprocessor side of Cloak. Every encrypted value lives here as a
//! [`Ciphertext`] record: a public Pedersen commitment plus the opening
//! `(value, blinding)` sealed under the network key. Callers only ever get
//! handles back.
//!
//! Operations open their operands inside this module, compute, and seal a
//! brand new record. Handles are never mutated. Addition and subtraction
//! reuse the commitment homomorphism when the result fits in a `u64`, and
//! recommit under a fresh blinding when it wraps. Comparison and select
//! always recommit, so their output reveals nothing about which branch won.
//!
//! Arithmetic is modulo 2^64. Callers that must not wrap use
//! [`try_increase`](CiphertextStore::try_increase) /
//! [`try_decrease`](CiphertextStore::try_decrease), which return an encrypted
//! success flag alongside the (possibly unchanged) result.
//!
//! ## Rollback
//!
//! Every new record and every new grant is journaled. A caller that runs a
//! multi-step transition takes a [`checkpoint`](CiphertextStore::checkpoint)
//! first and [`rollback`](CiphertextStore::rollback)s to it on failure, which
//! drops the records and revokes the grants made since. Once the transition
//! is final, [`settle`](CiphertextStore::settle) clears the journal.
//!
//! ## Lifetime
//!
//! The store is in-memory and lives as long as the process. Committed
//! records are never collected: any handle held by a ledger, a vault, an
//! event or an outstanding decryption request must stay openable, and the
//! store cannot see those references. Restarting the node starts from an
//! empty store.

use ark_bn254::Fr;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use super::acl::AccessList;
use super::handle::{CiphertextHandle, EncryptedBool, EncryptedU64, ValueKind};
use crate::commitment::{
    blinding_from_bytes, blinding_to_bytes, commit, random_blinding, Commitment, PedersenParams,
};
use crate::config::{HANDLE_DOMAIN, HANDLE_LENGTH, SEALED_OPENING_PLAINTEXT_LENGTH};
use crate::crypto::encryption::{open, seal, EncryptionError, NetworkKey, SealedBox};
use crate::crypto::hash::derive;
use crate::crypto::reencrypt::{seal_for, ReencryptedValue, ReencryptionError};
use crate::identity::Address;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown ciphertext handle {0}")]
    UnknownHandle(CiphertextHandle),

    #[error("{account} is not allowed to use handle {handle}")]
    NotAllowed {
        handle: CiphertextHandle,
        account: Address,
    },

    #[error("sealed opening for {0} is corrupt")]
    CorruptOpening(CiphertextHandle),

    #[error("sealing error: {0}")]
    Sealing(#[from] EncryptionError),

    #[error("re-encryption error: {0}")]
    Reencryption(#[from] ReencryptionError),
}

/// Marker returned by [`CiphertextStore::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCheckpoint(usize);

#[derive(Debug, Clone, Copy)]
enum StoreChange {
    Record(CiphertextHandle),
    Grant(CiphertextHandle, Address),
}

/// One stored encrypted value.
#[derive(Debug, Clone)]
pub struct Ciphertext {
    pub kind: ValueKind,
    pub commitment: Commitment,
    /// `value (u64 LE) || blinding (32 bytes LE)`, sealed with the handle as AAD.
    pub sealed: SealedBox,
}

pub struct CiphertextStore {
    params: PedersenParams,
    key: NetworkKey,
    records: HashMap<CiphertextHandle, Ciphertext>,
    acl: AccessList,
    journal: Vec<StoreChange>,
    salt: [u8; 32],
    counter: u64,
}

impl CiphertextStore {
    /// A fresh store with newly sampled commitment generators.
    pub fn new(key: NetworkKey) -> Self {
        Self::with_params(key, PedersenParams::setup(&mut OsRng))
    }

    pub fn with_params(key: NetworkKey, params: PedersenParams) -> Self {
        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        Self {
            params,
            key,
            records: HashMap::new(),
            acl: AccessList::new(),
            journal: Vec::new(),
            salt,
            counter: 0,
        }
    }

    pub fn params(&self) -> &PedersenParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, handle: &CiphertextHandle) -> bool {
        self.records.contains_key(handle)
    }

    pub fn ciphertext(&self, handle: &CiphertextHandle) -> Option<&Ciphertext> {
        self.records.get(handle)
    }

    pub fn commitment(&self, handle: &CiphertextHandle) -> Result<Commitment, StoreError> {
        self.records
            .get(handle)
            .map(|ct| ct.commitment)
            .ok_or(StoreError::UnknownHandle(*handle))
    }

    // ---- Inputs ----

    /// Encrypt a plaintext amount. The caller decides who may use it.
    pub fn encrypt(&mut self, value: u64) -> Result<EncryptedU64, StoreError> {
        let handle = self.insert_fresh(ValueKind::U64, value)?;
        debug!(handle = ?handle, "encrypted u64 input");
        Ok(EncryptedU64::wrap(handle))
    }

    pub fn encrypt_bool(&mut self, value: bool) -> Result<EncryptedBool, StoreError> {
        let handle = self.insert_fresh(ValueKind::Bool, value as u64)?;
        Ok(EncryptedBool::wrap(handle))
    }

    // ---- Arithmetic ----

    /// `a + b mod 2^64`.
    pub fn add(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, StoreError> {
        let (va, ra) = self.open(&a.handle())?;
        let (vb, rb) = self.open(&b.handle())?;
        let handle = match va.checked_add(vb) {
            Some(sum) => {
                let c = self.commitment(&a.handle())?.add(&self.commitment(&b.handle())?);
                self.insert(ValueKind::U64, sum, ra + rb, c)?
            }
            None => self.insert_fresh(ValueKind::U64, va.wrapping_add(vb))?,
        };
        Ok(EncryptedU64::wrap(handle))
    }

    /// `a - b mod 2^64`.
    pub fn sub(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedU64, StoreError> {
        let (va, ra) = self.open(&a.handle())?;
        let (vb, rb) = self.open(&b.handle())?;
        let handle = match va.checked_sub(vb) {
            Some(diff) => {
                let c = self.commitment(&a.handle())?.sub(&self.commitment(&b.handle())?);
                self.insert(ValueKind::U64, diff, ra - rb, c)?
            }
            None => self.insert_fresh(ValueKind::U64, va.wrapping_sub(vb))?,
        };
        Ok(EncryptedU64::wrap(handle))
    }

    /// Encrypted `a <= b`.
    pub fn le(&mut self, a: EncryptedU64, b: EncryptedU64) -> Result<EncryptedBool, StoreError> {
        let (va, _) = self.open(&a.handle())?;
        let (vb, _) = self.open(&b.handle())?;
        let handle = self.insert_fresh(ValueKind::Bool, (va <= vb) as u64)?;
        Ok(EncryptedBool::wrap(handle))
    }

    /// Encrypted `if cond { a } else { b }`. Always a fresh handle.
    pub fn select(
        &mut self,
        cond: EncryptedBool,
        a: EncryptedU64,
        b: EncryptedU64,
    ) -> Result<EncryptedU64, StoreError> {
        let (vc, _) = self.open(&cond.handle())?;
        let chosen = if vc != 0 { a } else { b };
        let (value, _) = self.open(&chosen.handle())?;
        let handle = self.insert_fresh(ValueKind::U64, value)?;
        Ok(EncryptedU64::wrap(handle))
    }

    /// `(ok, if ok { a + delta } else { a })` where `ok` means no overflow.
    pub fn try_increase(
        &mut self,
        a: EncryptedU64,
        delta: EncryptedU64,
    ) -> Result<(EncryptedBool, EncryptedU64), StoreError> {
        let (va, _) = self.open(&a.handle())?;
        let (vd, _) = self.open(&delta.handle())?;
        let ok = va.checked_add(vd).is_some();
        let flag = self.encrypt_bool(ok)?;
        let result = if ok {
            self.add(a, delta)?
        } else {
            EncryptedU64::wrap(self.insert_fresh(ValueKind::U64, va)?)
        };
        Ok((flag, result))
    }

    /// `(ok, if ok { a - delta } else { a })` where `ok` means no underflow.
    pub fn try_decrease(
        &mut self,
        a: EncryptedU64,
        delta: EncryptedU64,
    ) -> Result<(EncryptedBool, EncryptedU64), StoreError> {
        let (va, _) = self.open(&a.handle())?;
        let (vd, _) = self.open(&delta.handle())?;
        let ok = va >= vd;
        let flag = self.encrypt_bool(ok)?;
        let result = if ok {
            self.sub(a, delta)?
        } else {
            EncryptedU64::wrap(self.insert_fresh(ValueKind::U64, va)?)
        };
        Ok((flag, result))
    }

    // ---- Access control ----

    pub fn allow(
        &mut self,
        handle: impl Into<CiphertextHandle>,
        account: Address,
    ) -> Result<(), StoreError> {
        let handle = handle.into();
        if !self.records.contains_key(&handle) {
            return Err(StoreError::UnknownHandle(handle));
        }
        if self.acl.allow(handle, account) {
            self.journal.push(StoreChange::Grant(handle, account));
        }
        Ok(())
    }

    pub fn is_allowed(&self, handle: impl Into<CiphertextHandle>, account: &Address) -> bool {
        self.acl.is_allowed(&handle.into(), account)
    }

    /// `Ok` iff the handle exists and `account` may use it.
    pub fn require_allowed(
        &self,
        handle: impl Into<CiphertextHandle>,
        account: &Address,
    ) -> Result<(), StoreError> {
        let handle = handle.into();
        if !self.records.contains_key(&handle) {
            return Err(StoreError::UnknownHandle(handle));
        }
        if !self.acl.is_allowed(&handle, account) {
            return Err(StoreError::NotAllowed {
                handle,
                account: *account,
            });
        }
        Ok(())
    }

    pub fn allowed(&self, handle: &CiphertextHandle) -> Vec<Address> {
        self.acl.allowed(handle)
    }

    /// Seal a handle's value to `recipient` (an X25519 public key), on behalf
    /// of `requester`, who must be on the handle's access list.
    pub fn reencrypt(
        &self,
        handle: CiphertextHandle,
        requester: &Address,
        recipient: &[u8; 32],
    ) -> Result<ReencryptedValue, StoreError> {
        self.require_allowed(handle, requester)?;
        let (value, _) = self.open(&handle)?;
        Ok(seal_for(recipient, handle, value)?)
    }

    // ---- Journal ----

    pub fn checkpoint(&self) -> StoreCheckpoint {
        StoreCheckpoint(self.journal.len())
    }

    /// Undo every record and grant made after `checkpoint`.
    pub fn rollback(&mut self, checkpoint: StoreCheckpoint) {
        let mut dropped = 0usize;
        let mut revoked = 0usize;
        while self.journal.len() > checkpoint.0 {
            match self.journal.pop() {
                Some(StoreChange::Record(handle)) => {
                    self.records.remove(&handle);
                    self.acl.clear(&handle);
                    dropped += 1;
                }
                Some(StoreChange::Grant(handle, account)) => {
                    self.acl.revoke(&handle, &account);
                    revoked += 1;
                }
                None => break,
            }
        }
        if dropped + revoked > 0 {
            debug!(dropped, revoked, "store rolled back");
        }
    }

    /// Make everything journaled so far permanent.
    pub fn settle(&mut self) {
        self.journal.clear();
    }

    // ---- Internals ----

    fn open(&self, handle: &CiphertextHandle) -> Result<(u64, Fr), StoreError> {
        let ct = self
            .records
            .get(handle)
            .ok_or(StoreError::UnknownHandle(*handle))?;
        let plaintext = open(self.key.as_bytes(), &ct.sealed, handle.as_bytes())?;
        decode_opening(&plaintext).ok_or(StoreError::CorruptOpening(*handle))
    }

    fn next_handle(&mut self, kind: ValueKind) -> CiphertextHandle {
        self.counter += 1;
        let digest = derive(HANDLE_DOMAIN, &[&self.salt, &self.counter.to_le_bytes()]);
        let mut prefix = [0u8; HANDLE_LENGTH - 1];
        prefix.copy_from_slice(&digest[..HANDLE_LENGTH - 1]);
        CiphertextHandle::from_parts(prefix, kind)
    }

    fn insert_fresh(&mut self, kind: ValueKind, value: u64) -> Result<CiphertextHandle, StoreError> {
        let blinding = random_blinding(&mut OsRng);
        let commitment = commit(&self.params, value, blinding);
        self.insert(kind, value, blinding, commitment)
    }

    fn insert(
        &mut self,
        kind: ValueKind,
        value: u64,
        blinding: Fr,
        commitment: Commitment,
    ) -> Result<CiphertextHandle, StoreError> {
        let handle = self.next_handle(kind);
        let sealed = seal(
            self.key.as_bytes(),
            &encode_opening(value, &blinding),
            handle.as_bytes(),
        )?;
        self.records.insert(
            handle,
            Ciphertext {
                kind,
                commitment,
                sealed,
            },
        );
        self.journal.push(StoreChange::Record(handle));
        Ok(handle)
    }
}

pub(crate) fn encode_opening(value: u64, blinding: &Fr) -> [u8; SEALED_OPENING_PLAINTEXT_LENGTH] {
    let mut out = [0u8; SEALED_OPENING_PLAINTEXT_LENGTH];
    out[..8].copy_from_slice(&value.to_le_bytes());
    out[8..].copy_from_slice(&blinding_to_bytes(blinding));
    out
}

pub(crate) fn decode_opening(bytes: &[u8]) -> Option<(u64, Fr)> {
    if bytes.len() != SEALED_OPENING_PLAINTEXT_LENGTH {
        return None;
    }
    let value = u64::from_le_bytes(bytes[..8].try_into().ok()?);
    let blinding = blinding_from_bytes(&bytes[8..]).ok()?;
    Some((value, blinding))
}
