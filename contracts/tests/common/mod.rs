//! Shared setup for the runtime integration tests.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use cloak_contracts::ledger::LedgerSpec;
use cloak_contracts::{InMemoryBaseAsset, Runtime, RuntimeConfig};
use cloak_protocol::crypto::{CloakKeypair, NetworkKey};
use cloak_protocol::{
    Address, CiphertextStore, Clock, EncryptedU64, ManualClock, RequestId, Resolution,
    TrustedResponder,
};
use std::sync::Arc;

pub const UNDERLYING: &str = "USD";

pub struct Harness {
    pub rt: Runtime,
    pub clock: Arc<ManualClock>,
    pub responder: TrustedResponder,
    pub ledger: Address,
}

pub fn addr(name: &str) -> Address {
    Address::derive(name)
}

/// A runtime with one 6-decimal ledger over `USD` and the given base-asset
/// balances.
pub fn harness(funded: &[(&str, u64)]) -> Harness {
    let key = NetworkKey::generate();
    let responder = TrustedResponder::new(CloakKeypair::generate(), key.clone());
    let mut base = InMemoryBaseAsset::new();
    for (who, amount) in funded {
        base.mint(UNDERLYING, &addr(who), *amount).unwrap();
    }
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let rt = Runtime::new(
        RuntimeConfig::new(responder.public_key()),
        CiphertextStore::new(key),
        Box::new(base),
        clock.clone() as Arc<dyn Clock>,
    );
    let spec =
        LedgerSpec::for_underlying("cUSD", "Confidential USD", "cUSD", UNDERLYING, 6).unwrap();
    let ledger = rt.deploy_ledger(spec).unwrap();
    Harness {
        rt,
        clock,
        responder,
        ledger,
    }
}

impl Harness {
    pub fn decrypt(&self, handle: EncryptedU64) -> u64 {
        self.rt
            .with_store(|store| self.responder.decrypt(store, handle))
            .unwrap()
    }

    pub fn balance(&self, who: &str) -> Option<u64> {
        self.rt
            .balance_of(self.ledger, &addr(who))
            .unwrap()
            .map(|h| self.decrypt(h))
    }

    pub fn supply(&self) -> u64 {
        self.rt
            .total_supply(self.ledger)
            .unwrap()
            .map(|h| self.decrypt(h))
            .unwrap_or(0)
    }

    /// Sum of every live balance, read through the decrypt oracle.
    pub fn sum_of_balances(&self) -> u64 {
        self.rt
            .holders(self.ledger)
            .unwrap()
            .into_iter()
            .map(|(_, h)| self.decrypt(h))
            .sum()
    }

    pub fn base(&self, who: &str) -> u64 {
        self.rt.base_balance(self.ledger, &addr(who)).unwrap()
    }

    pub fn input(&self, who: &str, value: u64) -> EncryptedU64 {
        self.rt.encrypt_input(addr(who), value).unwrap()
    }

    pub fn wrap(&self, who: &str, amount: u64) -> EncryptedU64 {
        self.rt
            .wrap(self.ledger, addr(who), addr(who), amount)
            .unwrap()
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }

    /// An honest, attested answer to a pending request.
    pub fn answer(&self, id: RequestId) -> Resolution {
        let request = self
            .rt
            .pending_decryptions()
            .into_iter()
            .find(|r| r.id == id)
            .expect("request is pending");
        self.rt
            .with_store(|store| self.responder.respond(store, id, request.handle))
            .unwrap()
    }
}
