//! Per-handle access-control list.
//!
//! Being on a handle's list lets an account use the handle as an operand in
//! a privileged operation (transfer amount, decryption request) and ask for
//! it to be re-encrypted to its own key. Committed grants are permanent.
//! The only revocation is the store undoing a grant made by a transition
//! that then failed.

use std::collections::{BTreeSet, HashMap};

use super::handle::CiphertextHandle;
use crate::identity::Address;

#[derive(Debug, Default)]
pub struct AccessList {
    entries: HashMap<CiphertextHandle, BTreeSet<Address>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the grant is new.
    pub fn allow(&mut self, handle: CiphertextHandle, account: Address) -> bool {
        self.entries.entry(handle).or_default().insert(account)
    }

    pub(crate) fn revoke(&mut self, handle: &CiphertextHandle, account: &Address) {
        if let Some(accounts) = self.entries.get_mut(handle) {
            accounts.remove(account);
            if accounts.is_empty() {
                self.entries.remove(handle);
            }
        }
    }

    pub(crate) fn clear(&mut self, handle: &CiphertextHandle) {
        self.entries.remove(handle);
    }

    pub fn is_allowed(&self, handle: &CiphertextHandle, account: &Address) -> bool {
        self.entries
            .get(handle)
            .is_some_and(|accounts| accounts.contains(account))
    }

    /// Everyone allowed on `handle`, in address order.
    pub fn allowed(&self, handle: &CiphertextHandle) -> Vec<Address> {
        self.entries
            .get(handle)
            .map(|accounts| accounts.iter().copied().collect())
            .unwrap_or_default()
    }
}
