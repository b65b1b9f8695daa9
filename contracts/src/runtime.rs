//! # Runtime
//!
//! The single-writer executor every state transition goes through. It owns
//! the ciphertext store, the base asset, every deployed ledger and vault,
//! third-party receivers, and the event log, all behind one
//! `parking_lot::Mutex`. Callers on different threads block briefly and
//! never interleave.
//!
//! Each transition:
//!
//! 1. reads the clock once,
//! 2. expires overdue decryption requests (so a timeout is honored even if no
//!    sweeper has run yet),
//! 3. takes event and store checkpoints and runs the operation,
//! 4. rolls the event log and the ciphertext store back if the operation
//!    failed, then settles the store journal.
//!
//! Contracts already compute-then-commit their own fields. The store rollback
//! drops the records and access grants a failed operation made along the
//! way, so an aborted call leaves nobody holding a grant it never earned.
//!
//! ## Resolutions
//!
//! A [`Resolution`] names only its request id. The runtime finds whichever
//! contract's correlator issued it, verifies it there, and runs that
//! contract's continuation. Ids nobody issued fail the same way a replay
//! does: [`CorrelatorError::InvalidResolution`].

use chrono::{DateTime, Utc};
use cloak_protocol::ciphertext::CiphertextHandle;
use cloak_protocol::config::DEFAULT_DECRYPTION_TIMEOUT;
use cloak_protocol::crypto::{CloakPublicKey, ReencryptedValue};
use cloak_protocol::{
    Address, CiphertextStore, Clock, EncryptedU64, RequestId, Resolution, StoreError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::base_asset::BaseAsset;
use crate::correlator::{
    CorrelatorError, DecryptionRequest, RequestPurpose, ResolutionFault,
};
use crate::events::{EventLog, EventRecord};
use crate::ledger::{
    ConfidentialLedger, Disclosure, LedgerError, LedgerInfo, LedgerSpec, PendingUnwrap,
    UnwrapStatus,
};
use crate::operators::OperatorGrant;
use crate::receiver::{
    Acceptance, ConfidentialReceiver, ExecutionContext, ReceiverError, ReceiverRegistry,
    TransferNotice,
};
use crate::vault::{
    LendingVault, PendingWithdrawal, VaultError, VaultPosition, WithdrawDecision, WithdrawStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no ledger deployed at {0}")]
    UnknownLedger(Address),

    #[error("no vault deployed at {0}")]
    UnknownVault(Address),

    #[error("no receiver hosted at {0}")]
    NoReceiver(Address),

    #[error("address {0} is already in use")]
    AlreadyDeployed(Address),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("receiver error: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("correlator error: {0}")]
    Correlator(#[from] CorrelatorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RuntimeError {
    /// The resolution fault, if this error is a rejected resolution at any
    /// depth.
    pub fn resolution_fault(&self) -> Option<ResolutionFault> {
        let correlator = match self {
            RuntimeError::Correlator(err) => err,
            RuntimeError::Ledger(LedgerError::Correlator(err)) => err,
            RuntimeError::Vault(VaultError::Correlator(err)) => err,
            _ => return None,
        };
        match correlator {
            CorrelatorError::InvalidResolution { fault, .. } => Some(*fault),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_decryption_timeout_secs() -> u64 {
    DEFAULT_DECRYPTION_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// The responder key every correlator pins at deployment.
    pub responder_key: CloakPublicKey,
    /// Seconds a decryption request may stay pending.
    #[serde(default = "default_decryption_timeout_secs")]
    pub decryption_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn new(responder_key: CloakPublicKey) -> Self {
        Self {
            responder_key,
            decryption_timeout_secs: default_decryption_timeout_secs(),
        }
    }

    pub fn decryption_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.decryption_timeout_secs.min(u64::from(u32::MAX)) as i64)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What a resolution resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// `amount` base units are claimable by `recipient`.
    UnwrapClaimable { recipient: Address, amount: u64 },
    Disclosed { handle: CiphertextHandle, value: u64 },
    Withdrawal { owner: Address, status: WithdrawStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub request_id: RequestId,
    /// The contract that issued the request.
    pub requester: Address,
    pub purpose: RequestPurpose,
    pub outcome: ResolutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultInfo {
    pub address: Address,
    pub owner: Address,
    pub asset: Address,
    pub depositors: usize,
}

/// Counters for the gateway's status page and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub ledgers: usize,
    pub vaults: usize,
    pub handles: usize,
    pub events: usize,
    pub pending_decryptions: usize,
    pub resolved_total: u64,
    pub expired_total: u64,
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

struct World {
    store: CiphertextStore,
    base: Box<dyn BaseAsset>,
    ledgers: BTreeMap<Address, ConfidentialLedger>,
    vaults: BTreeMap<Address, LendingVault>,
    hooks: BTreeMap<Address, Box<dyn ConfidentialReceiver>>,
    events: EventLog,
    resolved_total: u64,
    expired_total: u64,
}

impl World {
    fn ledger(&self, address: &Address) -> Result<&ConfidentialLedger, RuntimeError> {
        self.ledgers
            .get(address)
            .ok_or(RuntimeError::UnknownLedger(*address))
    }

    fn vault(&self, address: &Address) -> Result<&LendingVault, RuntimeError> {
        self.vaults
            .get(address)
            .ok_or(RuntimeError::UnknownVault(*address))
    }

    fn is_taken(&self, address: &Address) -> bool {
        self.ledgers.contains_key(address)
            || self.vaults.contains_key(address)
            || self.hooks.contains_key(address)
    }

    /// Expire everything overdue at `now`, in every contract.
    fn sweep(&mut self, now: DateTime<Utc>) -> Result<Vec<RequestId>, RuntimeError> {
        let mut expired = Vec::new();
        let mut ctx = ExecutionContext::new(&mut self.store, &mut self.events, now);
        for ledger in self.ledgers.values_mut() {
            expired.extend(ledger.expire_due(&mut ctx)?);
        }
        for vault in self.vaults.values_mut() {
            expired.extend(vault.expire_due(&mut ctx)?);
        }
        self.expired_total += expired.len() as u64;
        Ok(expired)
    }

    fn pending(&self, now: DateTime<Utc>) -> Vec<DecryptionRequest> {
        let ledgers = self.ledgers.values().map(|l| l.correlator());
        let vaults = self.vaults.values().map(|v| v.correlator());
        let mut pending: Vec<DecryptionRequest> = ledgers
            .chain(vaults)
            .flat_map(|c| c.pending())
            .filter(|r| now < r.deadline)
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.submitted_at, r.id));
        pending
    }
}

/// Vaults and third-party hooks, seen as one registry by a ledger.
struct Receivers<'a> {
    vaults: &'a mut BTreeMap<Address, LendingVault>,
    hooks: &'a mut BTreeMap<Address, Box<dyn ConfidentialReceiver>>,
}

impl ReceiverRegistry for Receivers<'_> {
    fn receiver_mut(
        &mut self,
        address: &Address,
    ) -> Option<&mut (dyn ConfidentialReceiver + 'static)> {
        if let Some(vault) = self.vaults.get_mut(address) {
            return Some(vault as &mut (dyn ConfidentialReceiver + 'static));
        }
        self.hooks.get_mut(address).map(|hook| hook.as_mut())
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    world: Mutex<World>,
    clock: Arc<dyn Clock>,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        store: CiphertextStore,
        base: Box<dyn BaseAsset>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            responder = %config.responder_key,
            timeout_secs = config.decryption_timeout_secs,
            "runtime started"
        );
        Self {
            world: Mutex::new(World {
                store,
                base,
                ledgers: BTreeMap::new(),
                vaults: BTreeMap::new(),
                hooks: BTreeMap::new(),
                events: EventLog::new(),
                resolved_total: 0,
                expired_total: 0,
            }),
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run one state transition. See the module docs for the steps.
    fn transact<R>(
        &self,
        op: impl FnOnce(&mut World, DateTime<Utc>) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let mut world = self.world.lock();
        let now = self.clock.now();
        world.sweep(now)?;
        let checkpoint = world.events.checkpoint();
        let store_checkpoint = world.store.checkpoint();
        let result = op(&mut *world, now);
        if let Err(err) = &result {
            debug!(error = %err, "transition aborted");
            world.events.rollback(checkpoint);
            world.store.rollback(store_checkpoint);
        }
        world.store.settle();
        result
    }

    // ---- Deployment ----

    /// Deploy a ledger at the address derived from `ledger:<label>`.
    pub fn deploy_ledger(&self, spec: LedgerSpec) -> Result<Address, RuntimeError> {
        let address = Address::derive(&format!("ledger:{}", spec.label));
        let timeout = self.config.decryption_timeout();
        let responder = self.config.responder_key;
        self.transact(|world, _| {
            if world.is_taken(&address) {
                return Err(RuntimeError::AlreadyDeployed(address));
            }
            let ledger = ConfidentialLedger::new(address, spec, responder, timeout)?;
            info!(ledger = %address, symbol = ledger.symbol(), underlying = ledger.underlying(), "ledger deployed");
            world.ledgers.insert(address, ledger);
            Ok(address)
        })
    }

    /// Deploy a vault over the ledger at `asset`, at the address derived
    /// from `vault:<label>`.
    pub fn deploy_vault(
        &self,
        label: &str,
        owner: Address,
        asset: Address,
    ) -> Result<Address, RuntimeError> {
        let address = Address::derive(&format!("vault:{label}"));
        let timeout = self.config.decryption_timeout();
        let responder = self.config.responder_key;
        self.transact(|world, _| {
            world.ledger(&asset)?;
            if world.is_taken(&address) {
                return Err(RuntimeError::AlreadyDeployed(address));
            }
            world.vaults.insert(
                address,
                LendingVault::new(address, owner, asset, responder, timeout),
            );
            info!(vault = %address, owner = %owner, asset = %asset, "vault deployed");
            Ok(address)
        })
    }

    /// Host a third-party receiver at its own address.
    pub fn register_receiver(
        &self,
        receiver: Box<dyn ConfidentialReceiver>,
    ) -> Result<Address, RuntimeError> {
        let address = receiver.address();
        self.transact(|world, _| {
            if world.is_taken(&address) {
                return Err(RuntimeError::AlreadyDeployed(address));
            }
            world.hooks.insert(address, receiver);
            info!(receiver = %address, "receiver registered");
            Ok(address)
        })
    }

    // ---- Handles ----

    /// Encrypt a user input and give `owner` access to it.
    pub fn encrypt_input(&self, owner: Address, value: u64) -> Result<EncryptedU64, RuntimeError> {
        self.transact(|world, _| {
            let handle = world.store.encrypt(value)?;
            world.store.allow(handle, owner)?;
            Ok(handle)
        })
    }

    /// Share a handle `caller` may use with `account`.
    pub fn allow(
        &self,
        caller: Address,
        handle: CiphertextHandle,
        account: Address,
    ) -> Result<(), RuntimeError> {
        self.transact(|world, _| {
            world.store.require_allowed(handle, &caller)?;
            world.store.allow(handle, account)?;
            Ok(())
        })
    }

    pub fn is_allowed(&self, handle: CiphertextHandle, account: &Address) -> bool {
        self.world.lock().store.is_allowed(handle, account)
    }

    /// Seal a handle's value to `requester`'s X25519 key.
    pub fn reencrypt(
        &self,
        handle: CiphertextHandle,
        requester: Address,
        public_key: &[u8; 32],
    ) -> Result<ReencryptedValue, RuntimeError> {
        Ok(self
            .world
            .lock()
            .store
            .reencrypt(handle, &requester, public_key)?)
    }

    /// Read-only access to the store, e.g. for an in-process responder.
    pub fn with_store<R>(&self, f: impl FnOnce(&CiphertextStore) -> R) -> R {
        f(&self.world.lock().store)
    }

    // ---- Ledger ----

    pub fn wrap(
        &self,
        ledger: Address,
        caller: Address,
        to: Address,
        amount: u64,
    ) -> Result<EncryptedU64, RuntimeError> {
        self.transact(|world, now| {
            let World {
                store,
                base,
                ledgers,
                events,
                ..
            } = world;
            let ledger = ledgers
                .get_mut(&ledger)
                .ok_or(RuntimeError::UnknownLedger(ledger))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            Ok(ledger.wrap(&mut ctx, base.as_mut(), caller, to, amount)?)
        })
    }

    pub fn transfer(
        &self,
        ledger: Address,
        caller: Address,
        to: Address,
        amount: EncryptedU64,
        data: Vec<u8>,
    ) -> Result<EncryptedU64, RuntimeError> {
        self.transfer_from(ledger, caller, caller, to, amount, data)
    }

    pub fn transfer_from(
        &self,
        ledger: Address,
        caller: Address,
        from: Address,
        to: Address,
        amount: EncryptedU64,
        data: Vec<u8>,
    ) -> Result<EncryptedU64, RuntimeError> {
        self.transact(|world, now| {
            let World {
                store,
                ledgers,
                vaults,
                hooks,
                events,
                ..
            } = world;
            let ledger = ledgers
                .get_mut(&ledger)
                .ok_or(RuntimeError::UnknownLedger(ledger))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            let mut receivers = Receivers { vaults, hooks };
            Ok(ledger.transfer_from(&mut ctx, &mut receivers, caller, from, to, amount, data)?)
        })
    }

    pub fn authorize_operator(
        &self,
        ledger: Address,
        owner: Address,
        spender: Address,
        expiry: DateTime<Utc>,
    ) -> Result<OperatorGrant, RuntimeError> {
        self.transact(|world, now| {
            let World {
                store,
                ledgers,
                events,
                ..
            } = world;
            let ledger = ledgers
                .get_mut(&ledger)
                .ok_or(RuntimeError::UnknownLedger(ledger))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            Ok(ledger.authorize_operator(&mut ctx, owner, spender, expiry)?)
        })
    }

    pub fn revoke_operator(
        &self,
        ledger: Address,
        owner: Address,
        spender: Address,
    ) -> Result<Option<OperatorGrant>, RuntimeError> {
        self.transact(|world, now| {
            let World {
                store,
                ledgers,
                events,
                ..
            } = world;
            let ledger = ledgers
                .get_mut(&ledger)
                .ok_or(RuntimeError::UnknownLedger(ledger))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            Ok(ledger.revoke_operator(&mut ctx, owner, spender))
        })
    }

    pub fn is_operator(
        &self,
        ledger: Address,
        owner: &Address,
        spender: &Address,
    ) -> Result<bool, RuntimeError> {
        let now = self.clock.now();
        Ok(self.world.lock().ledger(&ledger)?.is_operator(owner, spender, now))
    }

    pub fn operator_grant(
        &self,
        ledger: Address,
        owner: &Address,
        spender: &Address,
    ) -> Result<Option<OperatorGrant>, RuntimeError> {
        Ok(self.world.lock().ledger(&ledger)?.operator_grant(owner, spender))
    }

    pub fn request_unwrap(
        &self,
        ledger: Address,
        caller: Address,
        from: Address,
        to: Address,
        amount: EncryptedU64,
    ) -> Result<RequestId, RuntimeError> {
        self.transact(|world, now| {
            let World {
                store,
                ledgers,
                events,
                ..
            } = world;
            let ledger = ledgers
                .get_mut(&ledger)
                .ok_or(RuntimeError::UnknownLedger(ledger))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            Ok(ledger.request_unwrap(&mut ctx, caller, from, to, amount)?)
        })
    }

    /// Release a resolved unwrap's base units to its recipient.
    pub fn claim_unwrap(
        &self,
        ledger: Address,
        caller: Address,
        id: &RequestId,
    ) -> Result<u64, RuntimeError> {
        self.transact(|world, _| {
            let World { base, ledgers, .. } = world;
            let ledger = ledgers
                .get_mut(&ledger)
                .ok_or(RuntimeError::UnknownLedger(ledger))?;
            Ok(ledger.claim_unwrap(base.as_mut(), caller, id)?)
        })
    }

    pub fn unwrap_request(
        &self,
        ledger: Address,
        id: &RequestId,
    ) -> Result<Option<PendingUnwrap>, RuntimeError> {
        Ok(self.world.lock().ledger(&ledger)?.unwrap_request(id).cloned())
    }

    pub fn disclose(
        &self,
        ledger: Address,
        caller: Address,
        handle: EncryptedU64,
    ) -> Result<RequestId, RuntimeError> {
        self.transact(|world, now| {
            let World {
                store,
                ledgers,
                events,
                ..
            } = world;
            let ledger = ledgers
                .get_mut(&ledger)
                .ok_or(RuntimeError::UnknownLedger(ledger))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            Ok(ledger.disclose(&mut ctx, caller, handle)?)
        })
    }

    pub fn disclosure(
        &self,
        ledger: Address,
        id: &RequestId,
    ) -> Result<Option<Disclosure>, RuntimeError> {
        Ok(self.world.lock().ledger(&ledger)?.disclosure(id).cloned())
    }

    pub fn balance_of(
        &self,
        ledger: Address,
        owner: &Address,
    ) -> Result<Option<EncryptedU64>, RuntimeError> {
        Ok(self.world.lock().ledger(&ledger)?.balance_of(owner))
    }

    pub fn total_supply(&self, ledger: Address) -> Result<Option<EncryptedU64>, RuntimeError> {
        Ok(self.world.lock().ledger(&ledger)?.total_supply())
    }

    /// Every account with a balance entry on `ledger`.
    pub fn holders(&self, ledger: Address) -> Result<Vec<(Address, EncryptedU64)>, RuntimeError> {
        Ok(self
            .world
            .lock()
            .ledger(&ledger)?
            .holders()
            .map(|(a, h)| (*a, *h))
            .collect())
    }

    pub fn ledger_info(&self, ledger: Address) -> Result<LedgerInfo, RuntimeError> {
        Ok(self.world.lock().ledger(&ledger)?.info())
    }

    pub fn ledgers(&self) -> Vec<LedgerInfo> {
        self.world.lock().ledgers.values().map(|l| l.info()).collect()
    }

    /// Base-asset balance, as the ledger at `ledger` sees its underlying.
    pub fn base_balance(&self, ledger: Address, account: &Address) -> Result<u64, RuntimeError> {
        let world = self.world.lock();
        let underlying = world.ledger(&ledger)?.underlying().to_string();
        Ok(world.base.balance_of(&underlying, account))
    }

    // ---- Vault ----

    /// Pull `amount` from `caller` into `vault` and credit the shares to
    /// `beneficiary` (default: `caller`). The vault must be a live operator
    /// of `caller` on its asset ledger.
    pub fn vault_deposit(
        &self,
        vault: Address,
        caller: Address,
        amount: EncryptedU64,
        beneficiary: Option<Address>,
    ) -> Result<EncryptedU64, RuntimeError> {
        self.transact(|world, now| {
            let asset = world.vault(&vault)?.asset();
            world.store.require_allowed(amount, &caller)?;
            world.store.allow(amount, vault)?;
            let data = beneficiary
                .map(|b| b.as_bytes().to_vec())
                .unwrap_or_default();

            let World {
                store,
                ledgers,
                vaults,
                hooks,
                events,
                ..
            } = world;
            let ledger = ledgers
                .get_mut(&asset)
                .ok_or(RuntimeError::UnknownLedger(asset))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            let mut receivers = Receivers { vaults, hooks };
            Ok(ledger.transfer_from(&mut ctx, &mut receivers, vault, caller, vault, amount, data)?)
        })
    }

    pub fn request_withdraw(
        &self,
        vault: Address,
        caller: Address,
        shares: EncryptedU64,
    ) -> Result<RequestId, RuntimeError> {
        self.transact(|world, now| {
            let World {
                store,
                vaults,
                events,
                ..
            } = world;
            let vault = vaults
                .get_mut(&vault)
                .ok_or(RuntimeError::UnknownVault(vault))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            Ok(vault.request_withdraw(&mut ctx, caller, shares)?)
        })
    }

    pub fn vault_position(
        &self,
        vault: Address,
        owner: &Address,
    ) -> Result<Option<VaultPosition>, RuntimeError> {
        Ok(self.world.lock().vault(&vault)?.position(owner).copied())
    }

    pub fn total_shares(&self, vault: Address) -> Result<Option<EncryptedU64>, RuntimeError> {
        Ok(self.world.lock().vault(&vault)?.total_shares())
    }

    pub fn withdrawal(
        &self,
        vault: Address,
        id: &RequestId,
    ) -> Result<Option<PendingWithdrawal>, RuntimeError> {
        Ok(self.world.lock().vault(&vault)?.withdrawal(id).cloned())
    }

    pub fn vault_info(&self, vault: Address) -> Result<VaultInfo, RuntimeError> {
        let world = self.world.lock();
        let vault = world.vault(&vault)?;
        Ok(VaultInfo {
            address: vault.address(),
            owner: vault.owner(),
            asset: vault.asset(),
            depositors: vault.positions().count(),
        })
    }

    pub fn vaults(&self) -> Vec<VaultInfo> {
        self.world
            .lock()
            .vaults
            .values()
            .map(|v| VaultInfo {
                address: v.address(),
                owner: v.owner(),
                asset: v.asset(),
                depositors: v.positions().count(),
            })
            .collect()
    }

    // ---- Notification ----

    /// Call `target`'s transfer hook directly, as `caller`. This is what an
    /// arbitrary account can do; receivers must refuse anyone but their
    /// ledger.
    pub fn invoke_transfer_hook(
        &self,
        caller: Address,
        target: Address,
        notice: TransferNotice,
    ) -> Result<Acceptance, RuntimeError> {
        self.transact(|world, now| {
            let World {
                store,
                vaults,
                hooks,
                events,
                ..
            } = world;
            let mut receivers = Receivers { vaults, hooks };
            let receiver = receivers
                .receiver_mut(&target)
                .ok_or(RuntimeError::NoReceiver(target))?;
            let mut ctx = ExecutionContext::new(store, events, now);
            let verdict = receiver.on_confidential_transfer_received(&mut ctx, caller, &notice);
            if let Err(err) = &verdict {
                warn!(caller = %caller, target = %target, error = %err, "direct hook call refused");
            }
            Ok(verdict?)
        })
    }

    // ---- Decryption ----

    /// Requests still awaiting a resolution, oldest first.
    pub fn pending_decryptions(&self) -> Vec<DecryptionRequest> {
        let now = self.clock.now();
        self.world.lock().pending(now)
    }

    /// Verify `resolution` against the contract that issued it and resume
    /// the suspended operation.
    ///
    /// # Errors
    ///
    /// [`CorrelatorError::InvalidResolution`] for unknown, replayed, expired,
    /// badly signed, or commitment-inconsistent resolutions. The request is
    /// then unchanged. A failing continuation also leaves it pending.
    pub fn resolve(&self, resolution: Resolution) -> Result<ResolutionReport, RuntimeError> {
        let id = resolution.request_id;
        let plaintext = resolution.plaintext;
        let report = self.transact(|world, now| {
            let ledger_addr = world
                .ledgers
                .iter()
                .find(|(_, l)| l.correlator().contains(&id))
                .map(|(a, _)| *a);
            let vault_addr = world
                .vaults
                .iter()
                .find(|(_, v)| v.correlator().contains(&id))
                .map(|(a, _)| *a);
            let report = match (ledger_addr, vault_addr) {
                (Some(address), _) => resolve_on_ledger(world, now, address, &resolution)?,
                (None, Some(address)) => resolve_on_vault(world, now, address, &resolution)?,
                (None, None) => {
                    return Err(CorrelatorError::invalid(id, ResolutionFault::UnknownRequest).into())
                }
            };
            world.resolved_total += 1;
            Ok(report)
        });

        match &report {
            Ok(report) => {
                info!(request_id = %id, requester = %report.requester, purpose = %report.purpose, plaintext, "decryption resolved");
            }
            Err(err) => warn!(request_id = %id, error = %err, "resolution rejected"),
        }
        report
    }

    /// Expire every overdue request now.
    pub fn expire_stale(&self) -> Result<Vec<RequestId>, RuntimeError> {
        let mut world = self.world.lock();
        let now = self.clock.now();
        let expired = world.sweep(now)?;
        world.store.settle();
        if !expired.is_empty() {
            info!(count = expired.len(), "expired stale decryption requests");
        }
        Ok(expired)
    }

    // ---- Events & stats ----

    pub fn events(&self, after: u64, limit: usize) -> Vec<EventRecord> {
        self.world.lock().events.since(after, limit)
    }

    pub fn stats(&self) -> RuntimeStats {
        let now = self.clock.now();
        let world = self.world.lock();
        RuntimeStats {
            ledgers: world.ledgers.len(),
            vaults: world.vaults.len(),
            handles: world.store.len(),
            events: world.events.len(),
            pending_decryptions: world.pending(now).len(),
            resolved_total: world.resolved_total,
            expired_total: world.expired_total,
        }
    }
}

fn resolve_on_ledger(
    world: &mut World,
    now: DateTime<Utc>,
    address: Address,
    resolution: &Resolution,
) -> Result<ResolutionReport, RuntimeError> {
    let World {
        store,
        ledgers,
        events,
        ..
    } = world;
    let ledger = ledgers
        .get_mut(&address)
        .ok_or(RuntimeError::UnknownLedger(address))?;
    let request = ledger.correlator().verify(store, resolution)?.clone();
    let mut ctx = ExecutionContext::new(store, events, now);
    ledger.on_decryption(&mut ctx, &request, resolution.plaintext)?;

    let outcome = match request.purpose {
        RequestPurpose::Unwrap => {
            let pending = ledger
                .unwrap_request(&request.id)
                .ok_or(LedgerError::UnknownRequest(request.id))?;
            let amount = match pending.status {
                UnwrapStatus::Claimable { amount } => amount,
                _ => return Err(LedgerError::UnknownRequest(request.id).into()),
            };
            ResolutionOutcome::UnwrapClaimable {
                recipient: pending.recipient,
                amount,
            }
        }
        _ => ResolutionOutcome::Disclosed {
            handle: request.handle,
            value: resolution.plaintext,
        },
    };
    Ok(ResolutionReport {
        request_id: request.id,
        requester: address,
        purpose: request.purpose,
        outcome,
    })
}

fn resolve_on_vault(
    world: &mut World,
    now: DateTime<Utc>,
    address: Address,
    resolution: &Resolution,
) -> Result<ResolutionReport, RuntimeError> {
    let vault = world.vault(&address)?;
    let request = vault.correlator().verify(&world.store, resolution)?.clone();
    let decision = vault.withdrawal_decision(&request, resolution.plaintext)?;
    let asset = vault.asset();

    let World {
        store,
        ledgers,
        vaults,
        hooks,
        events,
        ..
    } = world;
    let mut ctx = ExecutionContext::new(store, events, now);

    let owner = match decision {
        WithdrawDecision::Release { owner, amount } => {
            let ledger = ledgers
                .get_mut(&asset)
                .ok_or(RuntimeError::UnknownLedger(asset))?;
            let mut receivers = Receivers {
                vaults: &mut *vaults,
                hooks: &mut *hooks,
            };
            ledger.transfer_from(
                &mut ctx,
                &mut receivers,
                address,
                address,
                owner,
                amount,
                Vec::new(),
            )?;
            owner
        }
        WithdrawDecision::Revert => vaults
            .get(&address)
            .and_then(|v| v.withdrawal(&request.id))
            .map(|w| w.owner)
            .ok_or(VaultError::UnknownWithdrawal(request.id))?,
    };

    let vault = vaults
        .get_mut(&address)
        .ok_or(RuntimeError::UnknownVault(address))?;
    let status = vault.finish_withdrawal(&mut ctx, &request, resolution.plaintext)?;
    Ok(ResolutionReport {
        request_id: request.id,
        requester: address,
        purpose: request.purpose,
        outcome: ResolutionOutcome::Withdrawal { owner, status },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_asset::InMemoryBaseAsset;
    use cloak_protocol::crypto::{CloakKeypair, NetworkKey};
    use cloak_protocol::{ManualClock, TrustedResponder};

    fn runtime() -> (Runtime, TrustedResponder) {
        let key = NetworkKey::generate();
        let responder = TrustedResponder::new(CloakKeypair::generate(), key.clone());
        let runtime = Runtime::new(
            RuntimeConfig::new(responder.public_key()),
            CiphertextStore::new(key),
            Box::new(InMemoryBaseAsset::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        (runtime, responder)
    }

    fn spec(label: &str) -> LedgerSpec {
        LedgerSpec::for_underlying(label, "Confidential USD", "cUSD", "USD", 6).unwrap()
    }

    #[test]
    fn addresses_cannot_be_deployed_twice() {
        let (rt, _) = runtime();
        let ledger = rt.deploy_ledger(spec("cUSD")).unwrap();
        assert_eq!(ledger, Address::derive("ledger:cUSD"));
        assert!(matches!(
            rt.deploy_ledger(spec("cUSD")),
            Err(RuntimeError::AlreadyDeployed(a)) if a == ledger
        ));

        let vault = rt.deploy_vault("main", Address::derive("op"), ledger).unwrap();
        assert!(rt.deploy_vault("main", Address::derive("op"), ledger).is_err());
        assert_eq!(rt.vault_info(vault).unwrap().asset, ledger);
    }

    #[test]
    fn vault_needs_a_deployed_asset() {
        let (rt, _) = runtime();
        let missing = Address::derive("ledger:none");
        assert!(matches!(
            rt.deploy_vault("v", Address::derive("op"), missing),
            Err(RuntimeError::UnknownLedger(a)) if a == missing
        ));
    }

    #[test]
    fn unknown_request_is_an_invalid_resolution() {
        let (rt, responder) = runtime();
        rt.deploy_ledger(spec("cUSD")).unwrap();
        let handle = rt.encrypt_input(Address::derive("alice"), 5).unwrap();
        let bogus = RequestId::from_bytes([7; 32]);
        let resolution = rt
            .with_store(|store| responder.respond(store, bogus, handle.handle()))
            .unwrap();

        let err = rt.resolve(resolution).unwrap_err();
        assert_eq!(err.resolution_fault(), Some(ResolutionFault::UnknownRequest));
        assert_eq!(rt.stats().resolved_total, 0);
    }

    #[test]
    fn allow_requires_access_to_share() {
        let (rt, _) = runtime();
        let alice = Address::derive("alice");
        let bob = Address::derive("bob");
        let handle = rt.encrypt_input(alice, 9).unwrap();

        assert!(rt.allow(bob, handle.handle(), bob).is_err());
        rt.allow(alice, handle.handle(), bob).unwrap();
        assert!(rt.is_allowed(handle.handle(), &bob));
    }

    #[test]
    fn config_defaults_timeout_from_constants() {
        let key = CloakKeypair::generate().public_key();
        let json = serde_json::json!({ "responder_key": key.to_hex() });
        let config: RuntimeConfig = serde_json::from_value(json).unwrap();
        assert_eq!(
            config.decryption_timeout_secs,
            DEFAULT_DECRYPTION_TIMEOUT.as_secs()
        );
        assert_eq!(config.decryption_timeout(), chrono::Duration::seconds(300));
    }
}
