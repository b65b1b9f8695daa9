//! # Confidential Asset Ledger
//!
//! A wrapped token whose balances are ciphertext handles. The ledger never
//! looks at an amount: it asks the store to compare, select, add, and
//! subtract, and the results are new handles. Insufficient balances don't
//! fail transfers; they transfer an encrypted zero, because failing would
//! leak exactly the comparison the encryption is supposed to hide.
//!
//! ## Lifecycle of a unit
//!
//! 1. **Wrap**: the caller's base asset is escrowed into the ledger's
//!    account, and `amount / rate` confidential units are minted.
//! 2. **Transfer**: units move between encrypted balances, directly or via a
//!    live operator, optionally notifying a receiver contract.
//! 3. **Unwrap**: units are burned tentatively and a decryption of the burned
//!    amount is requested. Once the responder answers, the recipient claims
//!    `burned * rate` base units. If the request expires first, the burn is
//!    reversed.
//!
//! ## Atomicity
//!
//! Every operation computes its new handles first (store operations only
//! create records, they never alter existing ones), then runs its one
//! fallible external step, then commits. The transfer hook is the exception:
//! it runs after the balances are written, so the ledger keeps the prior
//! handles plus event and store checkpoints, and restores all three if the
//! hook says no. The store rollback also revokes the grants on the moved
//! amount, so a rejected recipient keeps no access to it.

use chrono::{DateTime, Utc};
use cloak_protocol::config::{
    DEFAULT_CONFIDENTIAL_DECIMALS, MAX_CALLBACK_DATA_LEN, MAX_CONFIDENTIAL_DECIMALS,
};
use cloak_protocol::crypto::CloakPublicKey;
use cloak_protocol::{Address, CiphertextHandle, EncryptedU64, RequestId, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::base_asset::{BaseAsset, BaseAssetError};
use crate::correlator::{
    CorrelatorError, DecryptionCorrelator, DecryptionRequest, RequestPurpose,
};
use crate::events::Event;
use crate::operators::{OperatorError, OperatorGrant, OperatorRegistry};
use crate::receiver::{
    Acceptance, ExecutionContext, ReceiverError, ReceiverRegistry, TransferNotice,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid operator expiry {expiry}: must be after {now}")]
    InvalidExpiry {
        expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// The caller is neither the owner nor a live operator of the owner.
    #[error("{caller} is not authorized to move funds of {owner}")]
    NotAuthorized { caller: Address, owner: Address },

    /// The base asset could not back a wrap.
    #[error("insufficient funds for {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: Address,
        required: u64,
        available: u64,
    },

    /// The account has never held a balance on this ledger.
    #[error("{0} has no balance")]
    NoBalance(Address),

    #[error("invalid receiver {0}")]
    InvalidReceiver(Address),

    #[error("receiver {receiver} rejected the transfer")]
    TransferRejected { receiver: Address },

    /// Claiming an unwrap that isn't claimable by this caller (yet, or anymore).
    #[error("unwrap {0} is unresolved, already claimed, or not claimable by this caller")]
    UnauthorizedOrUnresolved(RequestId),

    #[error("unwrap {0} expired; the burned amount was restored")]
    Expired(RequestId),

    #[error("no suspended operation for request {0}")]
    UnknownRequest(RequestId),

    #[error("request {request_id} has purpose {purpose}, which this ledger does not handle")]
    UnexpectedPurpose {
        request_id: RequestId,
        purpose: RequestPurpose,
    },

    #[error("amount overflow")]
    AmountOverflow,

    #[error("callback data is {len} bytes, limit is {max}")]
    CallbackDataTooLarge { len: usize, max: usize },

    #[error("invalid token metadata: {0}")]
    InvalidMetadata(String),

    #[error("base asset error: {0}")]
    BaseAsset(BaseAssetError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("correlator error: {0}")]
    Correlator(#[from] CorrelatorError),

    #[error("receiver error: {0}")]
    Receiver(#[from] ReceiverError),
}

impl From<OperatorError> for LedgerError {
    fn from(err: OperatorError) -> Self {
        match err {
            OperatorError::InvalidExpiry { expiry, now } => LedgerError::InvalidExpiry { expiry, now },
        }
    }
}

impl From<BaseAssetError> for LedgerError {
    fn from(err: BaseAssetError) -> Self {
        match err {
            BaseAssetError::InsufficientFunds {
                account,
                required,
                available,
                ..
            } => LedgerError::InsufficientFunds {
                account,
                required,
                available,
            },
            other => LedgerError::BaseAsset(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Deployment parameters of a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSpec {
    /// Deployment label; the ledger's address is derived from it.
    pub label: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// Base units per confidential unit.
    pub rate: u64,
    /// Identifier of the wrapped base asset.
    pub underlying: String,
}

impl LedgerSpec {
    /// Derive decimals and rate from the base asset's decimals: at most
    /// [`DEFAULT_CONFIDENTIAL_DECIMALS`] confidential decimals, with the rest
    /// absorbed into the rate.
    pub fn for_underlying(
        label: impl Into<String>,
        name: impl Into<String>,
        symbol: impl Into<String>,
        underlying: impl Into<String>,
        underlying_decimals: u8,
    ) -> Result<Self, LedgerError> {
        let decimals = underlying_decimals.min(DEFAULT_CONFIDENTIAL_DECIMALS);
        let rate = 10u64
            .checked_pow(u32::from(underlying_decimals - decimals))
            .ok_or_else(|| {
                LedgerError::InvalidMetadata(format!(
                    "underlying decimals {underlying_decimals} too large"
                ))
            })?;
        Ok(Self {
            label: label.into(),
            name: name.into(),
            symbol: symbol.into(),
            decimals,
            rate,
            underlying: underlying.into(),
        })
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.label.is_empty() || self.name.is_empty() || self.symbol.is_empty() {
            return Err(LedgerError::InvalidMetadata(
                "label, name and symbol must be non-empty".into(),
            ));
        }
        if self.underlying.is_empty() {
            return Err(LedgerError::InvalidMetadata("underlying must be set".into()));
        }
        if self.rate == 0 {
            return Err(LedgerError::InvalidMetadata("rate must be positive".into()));
        }
        if self.decimals > MAX_CONFIDENTIAL_DECIMALS {
            return Err(LedgerError::InvalidMetadata(format!(
                "decimals {} exceed maximum {}",
                self.decimals, MAX_CONFIDENTIAL_DECIMALS
            )));
        }
        Ok(())
    }
}

/// Public description of a deployed ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInfo {
    pub address: Address,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub rate: u64,
    pub underlying: String,
    pub holders: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnwrapStatus {
    /// Burned, waiting for the decryption.
    Pending,
    /// Decrypted; `amount` base units await the recipient.
    Claimable { amount: u64 },
    Claimed { amount: u64 },
    /// The request timed out and the burn was reversed.
    Expired,
}

/// Suspended second half of an unwrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUnwrap {
    pub owner: Address,
    pub recipient: Address,
    pub burned: EncryptedU64,
    pub status: UnwrapStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DisclosureStatus {
    Pending,
    Disclosed { value: u64 },
    Expired,
}

/// A public decryption requested by a holder of the handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disclosure {
    pub requester: Address,
    pub handle: EncryptedU64,
    pub status: DisclosureStatus,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct ConfidentialLedger {
    address: Address,
    spec: LedgerSpec,
    balances: BTreeMap<Address, EncryptedU64>,
    total_supply: Option<EncryptedU64>,
    operators: OperatorRegistry,
    correlator: DecryptionCorrelator,
    unwraps: HashMap<RequestId, PendingUnwrap>,
    disclosures: HashMap<RequestId, Disclosure>,
}

impl ConfidentialLedger {
    pub fn new(
        address: Address,
        spec: LedgerSpec,
        responder: CloakPublicKey,
        decryption_timeout: chrono::Duration,
    ) -> Result<Self, LedgerError> {
        spec.validate()?;
        Ok(Self {
            address,
            spec,
            balances: BTreeMap::new(),
            total_supply: None,
            operators: OperatorRegistry::new(),
            correlator: DecryptionCorrelator::new(address, responder, decryption_timeout),
            unwraps: HashMap::new(),
            disclosures: HashMap::new(),
        })
    }

    // ---- Accessors ----

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn symbol(&self) -> &str {
        &self.spec.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.spec.decimals
    }

    pub fn rate(&self) -> u64 {
        self.spec.rate
    }

    pub fn underlying(&self) -> &str {
        &self.spec.underlying
    }

    pub fn info(&self) -> LedgerInfo {
        LedgerInfo {
            address: self.address,
            name: self.spec.name.clone(),
            symbol: self.spec.symbol.clone(),
            decimals: self.spec.decimals,
            rate: self.spec.rate,
            underlying: self.spec.underlying.clone(),
            holders: self.balances.len(),
        }
    }

    /// `None` means the account has never held a balance, which is not the
    /// same as holding an encrypted zero.
    pub fn balance_of(&self, owner: &Address) -> Option<EncryptedU64> {
        self.balances.get(owner).copied()
    }

    pub fn holders(&self) -> impl Iterator<Item = (&Address, &EncryptedU64)> {
        self.balances.iter()
    }

    pub fn total_supply(&self) -> Option<EncryptedU64> {
        self.total_supply
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }

    pub fn correlator(&self) -> &DecryptionCorrelator {
        &self.correlator
    }

    pub fn unwrap_request(&self, id: &RequestId) -> Option<&PendingUnwrap> {
        self.unwraps.get(id)
    }

    pub fn disclosure(&self, id: &RequestId) -> Option<&Disclosure> {
        self.disclosures.get(id)
    }

    // ---- Operators ----

    /// Let `spender` move `owner`'s balance until `expiry` (exclusive).
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidExpiry`] if `expiry` is not after `ctx.now`.
    pub fn authorize_operator(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        owner: Address,
        spender: Address,
        expiry: DateTime<Utc>,
    ) -> Result<OperatorGrant, LedgerError> {
        let grant = self.operators.authorize(owner, spender, expiry, ctx.now)?;
        info!(ledger = %self.address, owner = %owner, spender = %spender, expiry = %expiry, "operator set");
        ctx.emit(Event::OperatorSet {
            ledger: self.address,
            owner,
            spender,
            expiry,
        });
        Ok(grant)
    }

    /// Remove a grant. Revoking a grant that doesn't exist is a no-op.
    pub fn revoke_operator(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        owner: Address,
        spender: Address,
    ) -> Option<OperatorGrant> {
        let removed = self.operators.revoke(&owner, &spender);
        if removed.is_some() {
            info!(ledger = %self.address, owner = %owner, spender = %spender, "operator revoked");
            ctx.emit(Event::OperatorRevoked {
                ledger: self.address,
                owner,
                spender,
            });
        }
        removed
    }

    pub fn is_operator(&self, owner: &Address, spender: &Address, now: DateTime<Utc>) -> bool {
        self.operators.is_operator(owner, spender, now)
    }

    pub fn operator_grant(&self, owner: &Address, spender: &Address) -> Option<OperatorGrant> {
        self.operators.grant(owner, spender).copied()
    }

    // ---- Wrap ----

    /// Escrow `amount` base units from `caller` and mint `amount / rate`
    /// confidential units to `to`. The remainder below `rate` stays with the
    /// caller.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientFunds`] if the caller's base balance can't
    /// cover the escrow.
    pub fn wrap(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        base: &mut dyn BaseAsset,
        caller: Address,
        to: Address,
        amount: u64,
    ) -> Result<EncryptedU64, LedgerError> {
        if to == Address::ZERO {
            return Err(LedgerError::InvalidReceiver(to));
        }
        let units = amount / self.spec.rate;
        let escrowed = units * self.spec.rate;

        let available = base.balance_of(&self.spec.underlying, &caller);
        if available < escrowed {
            return Err(LedgerError::InsufficientFunds {
                account: caller,
                required: escrowed,
                available,
            });
        }

        // Compute.
        let store = &mut *ctx.store;
        let amount_h = store.encrypt(units)?;
        let zero = store.encrypt(0)?;
        let supply = match self.total_supply {
            Some(supply) => supply,
            None => zero,
        };
        let (ok, new_supply) = store.try_increase(supply, amount_h)?;
        let minted = store.select(ok, amount_h, zero)?;
        let new_balance = match self.balances.get(&to) {
            Some(balance) => store.add(*balance, minted)?,
            None => minted,
        };
        store.allow(new_supply, self.address)?;
        for account in [self.address, to] {
            store.allow(new_balance, account)?;
            store.allow(minted, account)?;
        }
        let commitment = store.commitment(&minted.handle())?;

        // The one fallible external step.
        base.escrow(&self.spec.underlying, &caller, &self.address, escrowed)?;

        // Commit.
        self.balances.insert(to, new_balance);
        self.total_supply = Some(new_supply);
        info!(ledger = %self.address, caller = %caller, to = %to, escrowed, "wrapped");
        ctx.emit(Event::Wrapped {
            ledger: self.address,
            owner: to,
            amount: commitment,
        });
        Ok(minted)
    }

    // ---- Transfers ----

    /// Move up to `amount` from `from` to `to`.
    ///
    /// The amount actually moved is `amount` if `from` holds at least that
    /// much and an encrypted zero otherwise. Returns that handle.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotAuthorized`] unless `caller == from` or `caller`
    ///   is a live operator of `from`.
    /// - [`StoreError::NotAllowed`] if `caller` may not use `amount`.
    /// - [`LedgerError::NoBalance`] if `from` has no balance entry.
    /// - [`LedgerError::TransferRejected`] / [`LedgerError::Receiver`] if
    ///   `to`'s hook rejects or fails. Balances, events and access grants are
    ///   then exactly as before the call.
    #[allow(clippy::too_many_arguments)]
    pub fn transfer_from(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        receivers: &mut dyn ReceiverRegistry,
        caller: Address,
        from: Address,
        to: Address,
        amount: EncryptedU64,
        data: Vec<u8>,
    ) -> Result<EncryptedU64, LedgerError> {
        if caller != from && !self.operators.is_operator(&from, &caller, ctx.now) {
            warn!(ledger = %self.address, caller = %caller, owner = %from, "unauthorized transfer attempt");
            return Err(LedgerError::NotAuthorized {
                caller,
                owner: from,
            });
        }
        ctx.store.require_allowed(amount, &caller)?;
        if data.len() > MAX_CALLBACK_DATA_LEN {
            return Err(LedgerError::CallbackDataTooLarge {
                len: data.len(),
                max: MAX_CALLBACK_DATA_LEN,
            });
        }
        if to == Address::ZERO {
            return Err(LedgerError::InvalidReceiver(to));
        }
        let from_balance = self
            .balances
            .get(&from)
            .copied()
            .ok_or(LedgerError::NoBalance(from))?;
        let prev_to = self.balances.get(&to).copied();

        // Compute.
        let store_checkpoint = ctx.store.checkpoint();
        let store = &mut *ctx.store;
        let zero = store.encrypt(0)?;
        let ok = store.le(amount, from_balance)?;
        let transferred = store.select(ok, amount, zero)?;
        for account in [self.address, from, to, caller] {
            store.allow(transferred, account)?;
        }

        if from == to {
            // Nothing moves; the event still records the attempt.
            ctx.emit(Event::Transfer {
                ledger: self.address,
                from,
                to,
                amount: transferred,
            });
            return Ok(transferred);
        }

        let new_from = store.sub(from_balance, transferred)?;
        let new_to = match prev_to {
            Some(balance) => store.add(balance, transferred)?,
            None => store.add(zero, transferred)?,
        };
        for account in [self.address, from] {
            store.allow(new_from, account)?;
        }
        for account in [self.address, to] {
            store.allow(new_to, account)?;
        }

        // Apply both sides together, remembering how to undo them.
        let checkpoint = ctx.events.checkpoint();
        self.balances.insert(from, new_from);
        self.balances.insert(to, new_to);
        ctx.emit(Event::Transfer {
            ledger: self.address,
            from,
            to,
            amount: transferred,
        });

        if let Some(receiver) = receivers.receiver_mut(&to) {
            let notice = TransferNotice {
                operator: caller,
                from,
                to,
                amount: transferred,
                data,
            };
            let verdict = receiver.on_confidential_transfer_received(ctx, self.address, &notice);
            let failure = match verdict {
                Ok(Acceptance::Accept) => None,
                Ok(Acceptance::Reject) => Some(LedgerError::TransferRejected { receiver: to }),
                Err(err) => Some(LedgerError::Receiver(err)),
            };
            if let Some(err) = failure {
                warn!(ledger = %self.address, receiver = %to, error = %err, "transfer hook failed; rolling back");
                self.balances.insert(from, from_balance);
                match prev_to {
                    Some(balance) => self.balances.insert(to, balance),
                    None => self.balances.remove(&to),
                };
                ctx.events.rollback(checkpoint);
                ctx.store.rollback(store_checkpoint);
                return Err(err);
            }
        }

        debug!(ledger = %self.address, from = %from, to = %to, caller = %caller, "transfer");
        Ok(transferred)
    }

    /// [`transfer_from`](Self::transfer_from) with `from = caller`.
    pub fn transfer(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        receivers: &mut dyn ReceiverRegistry,
        caller: Address,
        to: Address,
        amount: EncryptedU64,
        data: Vec<u8>,
    ) -> Result<EncryptedU64, LedgerError> {
        self.transfer_from(ctx, receivers, caller, caller, to, amount, data)
    }

    // ---- Unwrap ----

    /// Phase 1 of an unwrap: burn up to `amount` from `from` and request a
    /// decryption of what was burned. The base units go to `to` once the
    /// request resolves and `to` claims them.
    pub fn request_unwrap(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        caller: Address,
        from: Address,
        to: Address,
        amount: EncryptedU64,
    ) -> Result<RequestId, LedgerError> {
        if caller != from && !self.operators.is_operator(&from, &caller, ctx.now) {
            return Err(LedgerError::NotAuthorized {
                caller,
                owner: from,
            });
        }
        ctx.store.require_allowed(amount, &caller)?;
        if to == Address::ZERO {
            return Err(LedgerError::InvalidReceiver(to));
        }
        let balance = self
            .balances
            .get(&from)
            .copied()
            .ok_or(LedgerError::NoBalance(from))?;
        let supply = self.total_supply.ok_or(LedgerError::NoBalance(from))?;

        let store = &mut *ctx.store;
        let zero = store.encrypt(0)?;
        let ok = store.le(amount, balance)?;
        let burned = store.select(ok, amount, zero)?;
        let new_balance = store.sub(balance, burned)?;
        let new_supply = store.sub(supply, burned)?;
        for account in [self.address, from, to] {
            store.allow(burned, account)?;
        }
        for account in [self.address, from] {
            store.allow(new_balance, account)?;
        }
        store.allow(new_supply, self.address)?;

        let id = self
            .correlator
            .submit(ctx, burned.handle(), RequestPurpose::Unwrap)?;

        self.balances.insert(from, new_balance);
        self.total_supply = Some(new_supply);
        self.unwraps.insert(
            id,
            PendingUnwrap {
                owner: from,
                recipient: to,
                burned,
                status: UnwrapStatus::Pending,
            },
        );
        info!(ledger = %self.address, from = %from, to = %to, request_id = %id, "unwrap requested");
        Ok(id)
    }

    /// Phase 2 of an unwrap: release the decrypted amount to its recipient.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Expired`] if the request expired.
    /// - [`LedgerError::UnauthorizedOrUnresolved`] if the request is still
    ///   pending, was already claimed, or `caller` is not the recipient.
    pub fn claim_unwrap(
        &mut self,
        base: &mut dyn BaseAsset,
        caller: Address,
        id: &RequestId,
    ) -> Result<u64, LedgerError> {
        let pending = self
            .unwraps
            .get(id)
            .ok_or(LedgerError::UnauthorizedOrUnresolved(*id))?;
        let amount = match pending.status {
            UnwrapStatus::Expired => return Err(LedgerError::Expired(*id)),
            UnwrapStatus::Claimable { amount } if caller == pending.recipient => amount,
            _ => return Err(LedgerError::UnauthorizedOrUnresolved(*id)),
        };
        let recipient = pending.recipient;

        base.release(&self.spec.underlying, &self.address, &recipient, amount)?;

        if let Some(pending) = self.unwraps.get_mut(id) {
            pending.status = UnwrapStatus::Claimed { amount };
        }
        info!(ledger = %self.address, recipient = %recipient, amount, request_id = %id, "unwrap claimed");
        Ok(amount)
    }

    // ---- Disclosure ----

    /// Publicly decrypt a handle the caller may use.
    pub fn disclose(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        caller: Address,
        handle: EncryptedU64,
    ) -> Result<RequestId, LedgerError> {
        ctx.store.require_allowed(handle, &caller)?;
        ctx.store.allow(handle, self.address)?;
        let id = self
            .correlator
            .submit(ctx, handle.handle(), RequestPurpose::Disclosure)?;
        self.disclosures.insert(
            id,
            Disclosure {
                requester: caller,
                handle,
                status: DisclosureStatus::Pending,
            },
        );
        Ok(id)
    }

    // ---- Continuations ----

    /// Resume the operation suspended on `request`, then mark it resolved.
    /// The caller must have verified the resolution against this ledger's
    /// correlator.
    pub fn on_decryption(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        request: &DecryptionRequest,
        plaintext: u64,
    ) -> Result<(), LedgerError> {
        let id = request.id;
        match request.purpose {
            RequestPurpose::Unwrap => {
                let pending = self
                    .unwraps
                    .get(&id)
                    .ok_or(LedgerError::UnknownRequest(id))?;
                let amount = plaintext
                    .checked_mul(self.spec.rate)
                    .ok_or(LedgerError::AmountOverflow)?;
                let commitment = ctx.store.commitment(&pending.burned.handle())?;
                let (owner, to) = (pending.owner, pending.recipient);

                self.correlator.mark_resolved(&id, plaintext, ctx.now)?;
                if let Some(pending) = self.unwraps.get_mut(&id) {
                    pending.status = UnwrapStatus::Claimable { amount };
                }
                ctx.emit(Event::Unwrapped {
                    ledger: self.address,
                    owner,
                    to,
                    amount: commitment,
                    request_id: id,
                });
            }
            RequestPurpose::Disclosure => {
                let handle: CiphertextHandle = self
                    .disclosures
                    .get(&id)
                    .ok_or(LedgerError::UnknownRequest(id))?
                    .handle
                    .into();

                self.correlator.mark_resolved(&id, plaintext, ctx.now)?;
                if let Some(disclosure) = self.disclosures.get_mut(&id) {
                    disclosure.status = DisclosureStatus::Disclosed { value: plaintext };
                }
                ctx.emit(Event::AmountDisclosed {
                    ledger: self.address,
                    handle,
                    value: plaintext,
                });
            }
            purpose => {
                return Err(LedgerError::UnexpectedPurpose {
                    request_id: id,
                    purpose,
                })
            }
        }
        Ok(())
    }

    /// Expire every overdue request, reversing tentative burns.
    pub fn expire_due(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Vec<RequestId>, LedgerError> {
        let due = self.correlator.expire_due(ctx.now);
        for id in &due {
            if let Some(pending) = self.unwraps.get(id).cloned() {
                let store = &mut *ctx.store;
                let restored = match self.balances.get(&pending.owner) {
                    Some(balance) => store.add(*balance, pending.burned)?,
                    None => pending.burned,
                };
                let supply = match self.total_supply {
                    Some(supply) => store.add(supply, pending.burned)?,
                    None => pending.burned,
                };
                for account in [self.address, pending.owner] {
                    store.allow(restored, account)?;
                }
                store.allow(supply, self.address)?;

                self.correlator.expire(ctx, id)?;
                self.balances.insert(pending.owner, restored);
                self.total_supply = Some(supply);
                if let Some(entry) = self.unwraps.get_mut(id) {
                    entry.status = UnwrapStatus::Expired;
                }
                info!(ledger = %self.address, owner = %pending.owner, request_id = %id, "unwrap expired; burn reversed");
            } else {
                self.correlator.expire(ctx, id)?;
                if let Some(disclosure) = self.disclosures.get_mut(id) {
                    disclosure.status = DisclosureStatus::Expired;
                }
            }
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_asset::InMemoryBaseAsset;
    use crate::events::EventLog;
    use crate::receiver::NoReceivers;
    use chrono::Duration;
    use cloak_protocol::crypto::{CloakKeypair, NetworkKey};
    use cloak_protocol::{CiphertextStore, TrustedResponder};

    struct World {
        store: CiphertextStore,
        events: EventLog,
        base: InMemoryBaseAsset,
        responder: TrustedResponder,
        ledger: ConfidentialLedger,
        now: DateTime<Utc>,
    }

    fn world() -> World {
        let key = NetworkKey::generate();
        let responder = TrustedResponder::new(CloakKeypair::generate(), key.clone());
        let spec = LedgerSpec::for_underlying("cUSD", "Confidential USD", "cUSD", "USD", 6).unwrap();
        let ledger = ConfidentialLedger::new(
            Address::derive("ledger:cUSD"),
            spec,
            responder.public_key(),
            Duration::seconds(300),
        )
        .unwrap();
        let mut base = InMemoryBaseAsset::new();
        base.mint("USD", &Address::derive("alice"), 10_000).unwrap();
        World {
            store: CiphertextStore::new(key),
            events: EventLog::new(),
            base,
            responder,
            ledger,
            now: Utc::now(),
        }
    }

    impl World {
        fn wrap(&mut self, who: &str, amount: u64) -> EncryptedU64 {
            let mut ctx = ExecutionContext::new(&mut self.store, &mut self.events, self.now);
            let a = Address::derive(who);
            self.ledger
                .wrap(&mut ctx, &mut self.base, a, a, amount)
                .unwrap()
        }

        fn balance(&self, who: &str) -> Option<u64> {
            self.ledger
                .balance_of(&Address::derive(who))
                .map(|h| self.responder.decrypt(&self.store, h).unwrap())
        }

        fn input(&mut self, who: &str, value: u64) -> EncryptedU64 {
            let h = self.store.encrypt(value).unwrap();
            self.store.allow(h, Address::derive(who)).unwrap();
            h
        }
    }

    #[test]
    fn spec_for_underlying_caps_decimals() {
        let s = LedgerSpec::for_underlying("w", "Wrapped", "cW", "W", 18).unwrap();
        assert_eq!((s.decimals, s.rate), (6, 1_000_000_000_000));
        let s = LedgerSpec::for_underlying("w", "Wrapped", "cW", "W", 2).unwrap();
        assert_eq!((s.decimals, s.rate), (2, 1));
        assert!(LedgerSpec::for_underlying("w", "Wrapped", "cW", "W", 40).is_err());

        let mut bad = s.clone();
        bad.rate = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn wrap_mints_and_escrows() {
        let mut w = world();
        w.wrap("alice", 1_000);
        assert_eq!(w.balance("alice"), Some(1_000));
        assert_eq!(w.base.balance_of("USD", &Address::derive("alice")), 9_000);
        assert_eq!(w.base.balance_of("USD", &w.ledger.address()), 1_000);
        let supply = w.ledger.total_supply().unwrap();
        assert_eq!(w.responder.decrypt(&w.store, supply).unwrap(), 1_000);
        assert!(matches!(
            w.events.records().last().unwrap().event,
            Event::Wrapped { .. }
        ));
    }

    #[test]
    fn wrap_without_funds_fails_cleanly() {
        let mut w = world();
        let bob = Address::derive("bob");
        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        let err = w.ledger.wrap(&mut ctx, &mut w.base, bob, bob, 1).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert!(w.ledger.balance_of(&bob).is_none());
        assert!(w.ledger.total_supply().is_none());
        assert!(w.events.is_empty());
    }

    #[test]
    fn wrap_remainder_below_rate_is_not_escrowed() {
        let mut w = world();
        w.ledger.spec.rate = 100;
        w.wrap("alice", 250);
        assert_eq!(w.balance("alice"), Some(2));
        assert_eq!(w.base.balance_of("USD", &Address::derive("alice")), 9_800);
    }

    #[test]
    fn insufficient_transfer_moves_encrypted_zero() {
        let mut w = world();
        w.wrap("alice", 100);
        let amount = w.input("alice", 500);
        let (alice, bob) = (Address::derive("alice"), Address::derive("bob"));

        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        let moved = w
            .ledger
            .transfer(&mut ctx, &mut NoReceivers, alice, bob, amount, vec![])
            .unwrap();
        assert_eq!(w.responder.decrypt(&w.store, moved).unwrap(), 0);
        assert_eq!(w.balance("alice"), Some(100));
        assert_eq!(w.balance("bob"), Some(0));
    }

    #[test]
    fn transfer_requires_owner_or_live_operator() {
        let mut w = world();
        w.wrap("alice", 100);
        let amount = w.input("mallory", 10);
        let (alice, mallory) = (Address::derive("alice"), Address::derive("mallory"));

        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        let err = w
            .ledger
            .transfer_from(&mut ctx, &mut NoReceivers, mallory, alice, mallory, amount, vec![])
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotAuthorized { .. }));

        let expiry = w.now + Duration::seconds(30);
        w.ledger
            .authorize_operator(&mut ctx, alice, mallory, expiry)
            .unwrap();
        w.ledger
            .transfer_from(&mut ctx, &mut NoReceivers, mallory, alice, mallory, amount, vec![])
            .unwrap();
        assert_eq!(w.balance("mallory"), Some(10));
    }

    #[test]
    fn transfer_requires_amount_acl_and_existing_balance() {
        let mut w = world();
        w.wrap("alice", 100);
        let (alice, bob) = (Address::derive("alice"), Address::derive("bob"));
        let foreign = w.input("bob", 10);

        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        assert!(matches!(
            w.ledger
                .transfer(&mut ctx, &mut NoReceivers, alice, bob, foreign, vec![]),
            Err(LedgerError::Store(StoreError::NotAllowed { .. }))
        ));
        assert!(matches!(
            w.ledger
                .transfer(&mut ctx, &mut NoReceivers, bob, alice, foreign, vec![]),
            Err(LedgerError::NoBalance(_))
        ));
    }

    #[test]
    fn unwrap_claim_flow() {
        let mut w = world();
        w.wrap("alice", 1_000);
        let alice = Address::derive("alice");
        let carol = Address::derive("carol");
        let amount = w.input("alice", 400);

        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        let id = w
            .ledger
            .request_unwrap(&mut ctx, alice, alice, carol, amount)
            .unwrap();
        assert_eq!(w.balance("alice"), Some(600));
        assert!(matches!(
            w.ledger.claim_unwrap(&mut w.base, carol, &id),
            Err(LedgerError::UnauthorizedOrUnresolved(_))
        ));

        let request = w.ledger.correlator().request(&id).unwrap().clone();
        let res = w.responder.respond(&w.store, id, request.handle).unwrap();
        w.ledger.correlator().verify(&w.store, &res).unwrap();
        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        w.ledger.on_decryption(&mut ctx, &request, res.plaintext).unwrap();

        assert!(matches!(
            w.ledger.claim_unwrap(&mut w.base, alice, &id),
            Err(LedgerError::UnauthorizedOrUnresolved(_))
        ));
        assert_eq!(w.ledger.claim_unwrap(&mut w.base, carol, &id).unwrap(), 400);
        assert_eq!(w.base.balance_of("USD", &carol), 400);
        assert!(matches!(
            w.ledger.claim_unwrap(&mut w.base, carol, &id),
            Err(LedgerError::UnauthorizedOrUnresolved(_))
        ));
    }

    #[test]
    fn expired_unwrap_restores_burn() {
        let mut w = world();
        w.wrap("alice", 1_000);
        let alice = Address::derive("alice");
        let amount = w.input("alice", 250);

        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        let id = w
            .ledger
            .request_unwrap(&mut ctx, alice, alice, alice, amount)
            .unwrap();
        assert_eq!(w.balance("alice"), Some(750));

        w.now += Duration::seconds(300);
        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        assert_eq!(w.ledger.expire_due(&mut ctx).unwrap(), vec![id]);
        assert!(w.ledger.expire_due(&mut ctx).unwrap().is_empty());

        assert_eq!(w.balance("alice"), Some(1_000));
        let supply = w.ledger.total_supply().unwrap();
        assert_eq!(w.responder.decrypt(&w.store, supply).unwrap(), 1_000);
        assert!(matches!(
            w.ledger.claim_unwrap(&mut w.base, alice, &id),
            Err(LedgerError::Expired(_))
        ));
    }

    #[test]
    fn disclose_publishes_value() {
        let mut w = world();
        let minted = w.wrap("alice", 77);
        let alice = Address::derive("alice");

        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        assert!(w
            .ledger
            .disclose(&mut ctx, Address::derive("eve"), minted)
            .is_err());
        let id = w.ledger.disclose(&mut ctx, alice, minted).unwrap();

        let request = w.ledger.correlator().request(&id).unwrap().clone();
        let res = w.responder.respond(&w.store, id, request.handle).unwrap();
        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        w.ledger.on_decryption(&mut ctx, &request, res.plaintext).unwrap();

        assert_eq!(
            w.ledger.disclosure(&id).unwrap().status,
            DisclosureStatus::Disclosed { value: 77 }
        );
        assert!(matches!(
            w.events.records().last().unwrap().event,
            Event::AmountDisclosed { value: 77, .. }
        ));
    }

    #[test]
    fn revoke_emits_only_when_present() {
        let mut w = world();
        let (alice, bob) = (Address::derive("alice"), Address::derive("bob"));
        let expiry = w.now + Duration::hours(1);
        let mut ctx = ExecutionContext::new(&mut w.store, &mut w.events, w.now);
        w.ledger.authorize_operator(&mut ctx, alice, bob, expiry).unwrap();
        assert!(w.ledger.revoke_operator(&mut ctx, alice, bob).is_some());
        assert!(w.ledger.revoke_operator(&mut ctx, alice, bob).is_none());
        assert_eq!(w.events.len(), 2);
    }
}
