//! # Lending Vault
//!
//! Pooled deposits of one confidential asset, tracked as encrypted share
//! positions (1 share per confidential unit). The vault never accepts a
//! deposit claim on its own: positions change only when its asset ledger
//! notifies it of an incoming transfer, and the hook verifies that the
//! notification really came from that ledger.
//!
//! ## Deposit
//!
//! The depositor authorizes the vault as an operator on the ledger. The vault
//! then pulls `amount` from the depositor with `transfer_from`, the ledger
//! calls back into [`LendingVault::on_confidential_transfer_received`], and
//! the shares are credited, all in one atomic transition.
//!
//! ## Withdrawal (two-phase)
//!
//! 1. [`request_withdraw`](LendingVault::request_withdraw) computes
//!    `sufficient = requested <= shares`, immediately debits
//!    `select(sufficient, requested, 0)` from the position and the total, and
//!    asks for `sufficient` to be decrypted.
//! 2. When the answer arrives: `true` releases the debited units from the
//!    vault to the owner on the ledger; `false` credits the debit back. If no
//!    answer arrives before the deadline, the debit is credited back as well.
//!
//! Debiting up front means two concurrent withdrawals can never both spend
//! the same shares. Debiting the *selected* amount means a withdrawal that
//! would underflow debits zero instead of wrapping.

use chrono::{DateTime, Utc};
use cloak_protocol::crypto::CloakPublicKey;
use cloak_protocol::{Address, EncryptedBool, EncryptedU64, RequestId, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

use crate::correlator::{
    CorrelatorError, DecryptionCorrelator, DecryptionRequest, RequestPurpose,
};
use crate::events::Event;
use crate::receiver::{
    Acceptance, ConfidentialReceiver, ExecutionContext, ReceiverError, TransferNotice,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum VaultError {
    /// Only accounts holding a position may withdraw.
    #[error("{0} has no position in this vault")]
    NoPosition(Address),

    #[error("no withdrawal for request {0}")]
    UnknownWithdrawal(RequestId),

    #[error("withdrawal {0} is no longer pending")]
    NotPending(RequestId),

    #[error("request {request_id} has purpose {purpose}, which the vault does not handle")]
    UnexpectedPurpose {
        request_id: RequestId,
        purpose: RequestPurpose,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("correlator error: {0}")]
    Correlator(#[from] CorrelatorError),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A depositor's encrypted share balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultPosition {
    pub shares: EncryptedU64,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a withdrawal was reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertReason {
    /// The position held fewer shares than requested.
    InsufficientShares,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WithdrawStatus {
    Pending,
    /// Units were transferred from the vault to the owner.
    Released,
    /// The debit was credited back.
    Reverted { reason: RevertReason },
    /// No answer before the deadline; the debit was credited back.
    Expired,
}

impl fmt::Display for WithdrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WithdrawStatus::Pending => write!(f, "Pending"),
            WithdrawStatus::Released => write!(f, "Released"),
            WithdrawStatus::Reverted { .. } => write!(f, "Reverted"),
            WithdrawStatus::Expired => write!(f, "Expired"),
        }
    }
}

/// Suspended second half of a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub owner: Address,
    pub requested: EncryptedU64,
    /// What was actually taken off the position: `requested` or zero.
    pub debited: EncryptedU64,
    pub sufficient: EncryptedBool,
    pub status: WithdrawStatus,
    pub requested_at: DateTime<Utc>,
}

/// What the runtime must do to finish a verified withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawDecision {
    /// Transfer `amount` from the vault to `owner` on the asset ledger, then
    /// call [`LendingVault::finish_withdrawal`].
    Release { owner: Address, amount: EncryptedU64 },
    /// Call [`LendingVault::finish_withdrawal`] directly.
    Revert,
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

pub struct LendingVault {
    address: Address,
    owner: Address,
    asset: Address,
    positions: BTreeMap<Address, VaultPosition>,
    total_shares: Option<EncryptedU64>,
    correlator: DecryptionCorrelator,
    withdrawals: HashMap<RequestId, PendingWithdrawal>,
}

impl LendingVault {
    /// A vault bound to `asset` (a ledger address) for its whole lifetime.
    pub fn new(
        address: Address,
        owner: Address,
        asset: Address,
        responder: CloakPublicKey,
        decryption_timeout: chrono::Duration,
    ) -> Self {
        Self {
            address,
            owner,
            asset,
            positions: BTreeMap::new(),
            total_shares: None,
            correlator: DecryptionCorrelator::new(address, responder, decryption_timeout),
            withdrawals: HashMap::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn asset(&self) -> Address {
        self.asset
    }

    pub fn position(&self, owner: &Address) -> Option<&VaultPosition> {
        self.positions.get(owner)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&Address, &VaultPosition)> {
        self.positions.iter()
    }

    pub fn total_shares(&self) -> Option<EncryptedU64> {
        self.total_shares
    }

    pub fn withdrawal(&self, id: &RequestId) -> Option<&PendingWithdrawal> {
        self.withdrawals.get(id)
    }

    pub fn correlator(&self) -> &DecryptionCorrelator {
        &self.correlator
    }

    /// Phase 1: debit up to `shares` from the caller's position and request a
    /// decryption of whether the position covered it.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NoPosition`] if the caller never deposited.
    /// - [`StoreError::NotAllowed`] if the caller may not use `shares`.
    pub fn request_withdraw(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        caller: Address,
        shares: EncryptedU64,
    ) -> Result<RequestId, VaultError> {
        let position = *self
            .positions
            .get(&caller)
            .ok_or(VaultError::NoPosition(caller))?;
        ctx.store.require_allowed(shares, &caller)?;
        let total = self.total_shares.ok_or(VaultError::NoPosition(caller))?;

        let store = &mut *ctx.store;
        let zero = store.encrypt(0)?;
        let sufficient = store.le(shares, position.shares)?;
        let debited = store.select(sufficient, shares, zero)?;
        let new_shares = store.sub(position.shares, debited)?;
        let new_total = store.sub(total, debited)?;
        store.allow(sufficient, self.address)?;
        for account in [self.address, caller] {
            store.allow(debited, account)?;
            store.allow(new_shares, account)?;
        }
        store.allow(new_total, self.address)?;

        let id = self
            .correlator
            .submit(ctx, sufficient.handle(), RequestPurpose::Withdrawal)?;

        self.positions.insert(
            caller,
            VaultPosition {
                shares: new_shares,
                updated_at: ctx.now,
                ..position
            },
        );
        self.total_shares = Some(new_total);
        self.withdrawals.insert(
            id,
            PendingWithdrawal {
                owner: caller,
                requested: shares,
                debited,
                sufficient,
                status: WithdrawStatus::Pending,
                requested_at: ctx.now,
            },
        );
        info!(vault = %self.address, owner = %caller, request_id = %id, "withdrawal requested");
        ctx.emit(Event::WithdrawRequested {
            vault: self.address,
            owner: caller,
            request_id: id,
        });
        Ok(id)
    }

    /// Decide how a verified withdrawal resolution should be finished.
    pub fn withdrawal_decision(
        &self,
        request: &DecryptionRequest,
        plaintext: u64,
    ) -> Result<WithdrawDecision, VaultError> {
        if request.purpose != RequestPurpose::Withdrawal {
            return Err(VaultError::UnexpectedPurpose {
                request_id: request.id,
                purpose: request.purpose,
            });
        }
        let pending = self.pending(&request.id)?;
        Ok(if plaintext != 0 {
            WithdrawDecision::Release {
                owner: pending.owner,
                amount: pending.debited,
            }
        } else {
            WithdrawDecision::Revert
        })
    }

    /// Phase 2: record the outcome and mark the request resolved. For a
    /// release, the ledger transfer must already have happened.
    pub fn finish_withdrawal(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        request: &DecryptionRequest,
        plaintext: u64,
    ) -> Result<WithdrawStatus, VaultError> {
        let id = request.id;
        let pending = self.pending(&id)?.clone();

        let status = if plaintext != 0 {
            WithdrawStatus::Released
        } else {
            let reason = RevertReason::InsufficientShares;
            self.credit_back(ctx, &pending)?;
            WithdrawStatus::Reverted { reason }
        };

        self.correlator.mark_resolved(&id, plaintext, ctx.now)?;
        if let Some(entry) = self.withdrawals.get_mut(&id) {
            entry.status = status;
        }
        info!(vault = %self.address, owner = %pending.owner, request_id = %id, outcome = %status, "withdrawal resolved");
        ctx.emit(Event::WithdrawResolved {
            vault: self.address,
            request_id: id,
            outcome: status,
        });
        Ok(status)
    }

    /// Expire overdue withdrawals, crediting their debits back.
    pub fn expire_due(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Vec<RequestId>, VaultError> {
        let due = self.correlator.expire_due(ctx.now);
        for id in &due {
            let pending = self.pending(id)?.clone();
            self.credit_back(ctx, &pending)?;
            self.correlator.expire(ctx, id)?;
            if let Some(entry) = self.withdrawals.get_mut(id) {
                entry.status = WithdrawStatus::Expired;
            }
            warn!(vault = %self.address, owner = %pending.owner, request_id = %id, "withdrawal expired; debit restored");
            ctx.emit(Event::WithdrawResolved {
                vault: self.address,
                request_id: *id,
                outcome: WithdrawStatus::Expired,
            });
        }
        Ok(due)
    }

    fn pending(&self, id: &RequestId) -> Result<&PendingWithdrawal, VaultError> {
        let pending = self
            .withdrawals
            .get(id)
            .ok_or(VaultError::UnknownWithdrawal(*id))?;
        if pending.status != WithdrawStatus::Pending {
            return Err(VaultError::NotPending(*id));
        }
        Ok(pending)
    }

    /// Add a withdrawal's debit back to its position and the total.
    fn credit_back(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        pending: &PendingWithdrawal,
    ) -> Result<(), VaultError> {
        let position = *self
            .positions
            .get(&pending.owner)
            .ok_or(VaultError::NoPosition(pending.owner))?;
        let store = &mut *ctx.store;
        let restored = store.add(position.shares, pending.debited)?;
        let total = match self.total_shares {
            Some(total) => store.add(total, pending.debited)?,
            None => pending.debited,
        };
        for account in [self.address, pending.owner] {
            store.allow(restored, account)?;
        }
        store.allow(total, self.address)?;

        self.positions.insert(
            pending.owner,
            VaultPosition {
                shares: restored,
                updated_at: ctx.now,
                ..position
            },
        );
        self.total_shares = Some(total);
        Ok(())
    }
}

impl ConfidentialReceiver for LendingVault {
    fn address(&self) -> Address {
        self.address
    }

    /// Credit shares for a deposit. Only the asset ledger may call this.
    fn on_confidential_transfer_received(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        caller: Address,
        notice: &TransferNotice,
    ) -> Result<Acceptance, ReceiverError> {
        if caller != self.asset {
            warn!(vault = %self.address, caller = %caller, "deposit notification from untrusted caller");
            return Err(ReceiverError::UntrustedCaller {
                expected: self.asset,
                actual: caller,
            });
        }
        if notice.to != self.address {
            return Err(ReceiverError::MisdirectedTransfer {
                expected: self.address,
                actual: notice.to,
            });
        }
        let beneficiary = parse_beneficiary(&notice.data, notice.from)?;

        // Compute everything before touching state.
        let store = &mut *ctx.store;
        let existing = self.positions.get(&beneficiary).copied();
        let shares = match existing {
            Some(position) => store.add(position.shares, notice.amount)?,
            None => notice.amount,
        };
        let total = match self.total_shares {
            Some(total) => store.add(total, notice.amount)?,
            None => notice.amount,
        };
        for account in [self.address, beneficiary] {
            store.allow(shares, account)?;
        }
        store.allow(total, self.address)?;

        let now = ctx.now;
        let position = match existing {
            Some(position) => VaultPosition {
                shares,
                updated_at: now,
                ..position
            },
            None => VaultPosition {
                shares,
                opened_at: now,
                updated_at: now,
            },
        };
        self.positions.insert(beneficiary, position);
        self.total_shares = Some(total);
        info!(vault = %self.address, owner = %beneficiary, from = %notice.from, "deposit credited");
        ctx.emit(Event::Deposited {
            vault: self.address,
            owner: beneficiary,
            shares: notice.amount,
        });
        Ok(Acceptance::Accept)
    }
}

/// Deposit data is either empty (credit the sender) or a 20-byte beneficiary.
fn parse_beneficiary(data: &[u8], from: Address) -> Result<Address, ReceiverError> {
    if data.is_empty() {
        return Ok(from);
    }
    Address::from_slice(data).ok_or(ReceiverError::MalformedData { len: data.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use chrono::Duration;
    use cloak_protocol::crypto::{CloakKeypair, NetworkKey};
    use cloak_protocol::{CiphertextStore, TrustedResponder};

    struct Fixture {
        store: CiphertextStore,
        events: EventLog,
        responder: TrustedResponder,
        vault: LendingVault,
        asset: Address,
        now: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let key = NetworkKey::generate();
        let responder = TrustedResponder::new(CloakKeypair::generate(), key.clone());
        let asset = Address::derive("ledger:cUSD");
        let vault = LendingVault::new(
            Address::derive("vault:main"),
            Address::derive("operator"),
            asset,
            responder.public_key(),
            Duration::seconds(60),
        );
        Fixture {
            store: CiphertextStore::new(key),
            events: EventLog::new(),
            responder,
            vault,
            asset,
            now: Utc::now(),
        }
    }

    impl Fixture {
        fn notify(
            &mut self,
            caller: Address,
            from: &str,
            amount: u64,
            data: Vec<u8>,
        ) -> Result<Acceptance, ReceiverError> {
            let amount = self.store.encrypt(amount).unwrap();
            self.store.allow(amount, self.vault.address()).unwrap();
            let notice = TransferNotice {
                operator: self.vault.address(),
                from: Address::derive(from),
                to: self.vault.address(),
                amount,
                data,
            };
            let mut ctx = ExecutionContext::new(&mut self.store, &mut self.events, self.now);
            self.vault
                .on_confidential_transfer_received(&mut ctx, caller, &notice)
        }

        fn shares(&self, who: &str) -> u64 {
            let position = self.vault.position(&Address::derive(who)).unwrap();
            self.responder.decrypt(&self.store, position.shares).unwrap()
        }

        fn total(&self) -> u64 {
            self.responder
                .decrypt(&self.store, self.vault.total_shares().unwrap())
                .unwrap()
        }

        fn withdraw(&mut self, who: &str, amount: u64) -> RequestId {
            let owner = Address::derive(who);
            let shares = self.store.encrypt(amount).unwrap();
            self.store.allow(shares, owner).unwrap();
            let mut ctx = ExecutionContext::new(&mut self.store, &mut self.events, self.now);
            self.vault.request_withdraw(&mut ctx, owner, shares).unwrap()
        }

        /// Answer `id` honestly, returning the verified request and plaintext.
        fn answer(&self, id: RequestId) -> (DecryptionRequest, u64) {
            let handle = self.vault.correlator().request(&id).unwrap().handle;
            let resolution = self.responder.respond(&self.store, id, handle).unwrap();
            let request = self
                .vault
                .correlator()
                .verify(&self.store, &resolution)
                .unwrap()
                .clone();
            (request, resolution.plaintext)
        }
    }

    #[test]
    fn deposit_from_asset_ledger_credits_sender() {
        let mut f = fixture();
        let asset = f.asset;
        assert_eq!(f.notify(asset, "alice", 100, vec![]).unwrap(), Acceptance::Accept);
        assert_eq!(f.notify(asset, "alice", 50, vec![]).unwrap(), Acceptance::Accept);

        assert_eq!(f.shares("alice"), 150);
        assert_eq!(f.total(), 150);
        let position = f.vault.position(&Address::derive("alice")).unwrap();
        assert!(f.store.is_allowed(position.shares, &Address::derive("alice")));
        assert_eq!(f.events.len(), 2);
    }

    #[test]
    fn deposit_data_names_the_beneficiary() {
        let mut f = fixture();
        let asset = f.asset;
        let bob = Address::derive("bob");
        f.notify(asset, "alice", 70, bob.as_bytes().to_vec()).unwrap();

        assert!(f.vault.position(&Address::derive("alice")).is_none());
        assert_eq!(f.shares("bob"), 70);

        let err = f.notify(asset, "alice", 1, vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, ReceiverError::MalformedData { len: 3 }));
    }

    #[test]
    fn spoofed_notification_is_rejected_without_state_change() {
        let mut f = fixture();
        let mallory = Address::derive("mallory");
        let err = f.notify(mallory, "mallory", 1_000, vec![]).unwrap_err();
        assert!(matches!(err, ReceiverError::UntrustedCaller { actual, .. } if actual == mallory));
        assert!(f.vault.position(&mallory).is_none());
        assert!(f.vault.total_shares().is_none());
        assert!(f.events.is_empty());
    }

    #[test]
    fn covered_withdrawal_releases_debit() {
        let mut f = fixture();
        let asset = f.asset;
        f.notify(asset, "alice", 100, vec![]).unwrap();

        let id = f.withdraw("alice", 40);
        assert_eq!(f.shares("alice"), 60);
        assert_eq!(f.total(), 60);

        let (request, plaintext) = f.answer(id);
        assert_eq!(plaintext, 1);
        let decision = f.vault.withdrawal_decision(&request, plaintext).unwrap();
        let WithdrawDecision::Release { owner, amount } = decision else {
            panic!("expected release, got {decision:?}");
        };
        assert_eq!(owner, Address::derive("alice"));
        assert_eq!(f.responder.decrypt(&f.store, amount).unwrap(), 40);

        let mut ctx = ExecutionContext::new(&mut f.store, &mut f.events, f.now);
        let status = f.vault.finish_withdrawal(&mut ctx, &request, plaintext).unwrap();
        assert_eq!(status, WithdrawStatus::Released);
        assert_eq!(f.shares("alice"), 60);
        assert!(!f.vault.correlator().request(&id).unwrap().status.is_pending());
    }

    #[test]
    fn uncovered_withdrawal_debits_zero_and_reverts() {
        let mut f = fixture();
        let asset = f.asset;
        f.notify(asset, "alice", 100, vec![]).unwrap();

        let id = f.withdraw("alice", 500);
        // Nothing was taken: the selected debit is zero.
        assert_eq!(f.shares("alice"), 100);

        let (request, plaintext) = f.answer(id);
        assert_eq!(plaintext, 0);
        assert_eq!(
            f.vault.withdrawal_decision(&request, plaintext).unwrap(),
            WithdrawDecision::Revert
        );
        let mut ctx = ExecutionContext::new(&mut f.store, &mut f.events, f.now);
        let status = f.vault.finish_withdrawal(&mut ctx, &request, plaintext).unwrap();
        assert_eq!(
            status,
            WithdrawStatus::Reverted {
                reason: RevertReason::InsufficientShares
            }
        );
        assert_eq!(f.shares("alice"), 100);
        assert_eq!(f.total(), 100);

        // A second finish is refused.
        let mut ctx = ExecutionContext::new(&mut f.store, &mut f.events, f.now);
        assert!(matches!(
            f.vault.finish_withdrawal(&mut ctx, &request, plaintext),
            Err(VaultError::NotPending(_))
        ));
    }

    #[test]
    fn expired_withdrawal_restores_debit_once() {
        let mut f = fixture();
        let asset = f.asset;
        f.notify(asset, "alice", 100, vec![]).unwrap();
        let id = f.withdraw("alice", 30);
        assert_eq!(f.shares("alice"), 70);

        f.now = f.now + Duration::seconds(59);
        let mut ctx = ExecutionContext::new(&mut f.store, &mut f.events, f.now);
        assert!(f.vault.expire_due(&mut ctx).unwrap().is_empty());

        f.now = f.now + Duration::seconds(1);
        let mut ctx = ExecutionContext::new(&mut f.store, &mut f.events, f.now);
        assert_eq!(f.vault.expire_due(&mut ctx).unwrap(), vec![id]);
        let mut ctx = ExecutionContext::new(&mut f.store, &mut f.events, f.now);
        assert!(f.vault.expire_due(&mut ctx).unwrap().is_empty());

        assert_eq!(f.shares("alice"), 100);
        assert_eq!(f.total(), 100);
        assert_eq!(f.vault.withdrawal(&id).unwrap().status, WithdrawStatus::Expired);
    }

    #[test]
    fn withdrawal_needs_a_position() {
        let mut f = fixture();
        let bob = Address::derive("bob");
        let shares = f.store.encrypt(1).unwrap();
        f.store.allow(shares, bob).unwrap();
        let mut ctx = ExecutionContext::new(&mut f.store, &mut f.events, f.now);
        assert!(matches!(
            f.vault.request_withdraw(&mut ctx, bob, shares),
            Err(VaultError::NoPosition(a)) if a == bob
        ));
    }
}
