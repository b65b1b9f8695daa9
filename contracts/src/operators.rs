//! # Operator Registry
//!
//! An owner can let another account (a vault, a payment processor, a bot)
//! move their confidential balance for a bounded window of time. There is no
//! amount allowance: encrypted amounts can't be compared in the clear, so the
//! only knobs are *who* and *until when*.
//!
//! - A grant is live iff `now < expiry`. At the expiry instant it is dead.
//! - Re-granting overwrites. The latest expiry wins, even if it is shorter.
//! - Revocation deletes the grant outright.
//!
//! [`OperatorRegistry::is_operator`] answers "may spender act right now";
//! [`OperatorRegistry::grant`] returns the raw record, expired or not, for
//! anyone who wants to inspect it.

use chrono::{DateTime, Utc};
use cloak_protocol::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperatorError {
    /// The expiry is not strictly in the future.
    #[error("invalid operator expiry {expiry}: must be after {now}")]
    InvalidExpiry {
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

/// One `(owner, spender)` delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorGrant {
    pub owner: Address,
    pub spender: Address,
    pub expiry: DateTime<Utc>,
}

impl OperatorGrant {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }
}

#[derive(Debug, Default, Clone)]
pub struct OperatorRegistry {
    grants: BTreeMap<(Address, Address), OperatorGrant>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or overwrite the grant for `(owner, spender)`.
    ///
    /// # Errors
    ///
    /// [`OperatorError::InvalidExpiry`] if `expiry <= now`.
    pub fn authorize(
        &mut self,
        owner: Address,
        spender: Address,
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<OperatorGrant, OperatorError> {
        if expiry <= now {
            return Err(OperatorError::InvalidExpiry { expiry, now });
        }
        let grant = OperatorGrant {
            owner,
            spender,
            expiry,
        };
        self.grants.insert((owner, spender), grant);
        Ok(grant)
    }

    /// Remove a grant. Returns it if there was one.
    pub fn revoke(&mut self, owner: &Address, spender: &Address) -> Option<OperatorGrant> {
        self.grants.remove(&(*owner, *spender))
    }

    pub fn is_operator(&self, owner: &Address, spender: &Address, now: DateTime<Utc>) -> bool {
        self.grants
            .get(&(*owner, *spender))
            .is_some_and(|grant| grant.is_live(now))
    }

    /// The stored record, live or expired.
    pub fn grant(&self, owner: &Address, spender: &Address) -> Option<&OperatorGrant> {
        self.grants.get(&(*owner, *spender))
    }

    /// All grants made by `owner`.
    pub fn grants_by(&self, owner: &Address) -> Vec<OperatorGrant> {
        self.grants
            .values()
            .filter(|grant| grant.owner == *owner)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn parties() -> (Address, Address) {
        (Address::derive("alice"), Address::derive("vault"))
    }

    #[test]
    fn live_until_expiry_exclusive() {
        let (owner, spender) = parties();
        let now = Utc::now();
        let mut reg = OperatorRegistry::new();
        reg.authorize(owner, spender, now + Duration::seconds(10), now)
            .unwrap();

        assert!(reg.is_operator(&owner, &spender, now));
        assert!(reg.is_operator(&owner, &spender, now + Duration::seconds(9)));
        assert!(!reg.is_operator(&owner, &spender, now + Duration::seconds(10)));
        assert!(!reg.is_operator(&spender, &owner, now), "grants are directional");
    }

    #[test]
    fn expiry_must_be_in_the_future() {
        let (owner, spender) = parties();
        let now = Utc::now();
        let mut reg = OperatorRegistry::new();
        assert!(matches!(
            reg.authorize(owner, spender, now, now),
            Err(OperatorError::InvalidExpiry { .. })
        ));
        assert!(reg
            .authorize(owner, spender, now - Duration::seconds(1), now)
            .is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn regrant_overwrites_even_when_shorter() {
        let (owner, spender) = parties();
        let now = Utc::now();
        let mut reg = OperatorRegistry::new();
        reg.authorize(owner, spender, now + Duration::hours(2), now)
            .unwrap();
        reg.authorize(owner, spender, now + Duration::minutes(5), now)
            .unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.grant(&owner, &spender).unwrap().expiry,
            now + Duration::minutes(5)
        );
        assert!(!reg.is_operator(&owner, &spender, now + Duration::minutes(30)));
    }

    #[test]
    fn grant_record_outlives_liveness() {
        let (owner, spender) = parties();
        let now = Utc::now();
        let mut reg = OperatorRegistry::new();
        reg.authorize(owner, spender, now + Duration::seconds(1), now)
            .unwrap();

        let later = now + Duration::hours(1);
        assert!(!reg.is_operator(&owner, &spender, later));
        assert!(reg.grant(&owner, &spender).is_some());
    }

    #[test]
    fn revoke_removes_grant() {
        let (owner, spender) = parties();
        let now = Utc::now();
        let mut reg = OperatorRegistry::new();
        reg.authorize(owner, spender, now + Duration::hours(1), now)
            .unwrap();
        assert!(reg.revoke(&owner, &spender).is_some());
        assert!(reg.revoke(&owner, &spender).is_none());
        assert!(!reg.is_operator(&owner, &spender, now));
        assert!(reg.grants_by(&owner).is_empty());
    }
}
