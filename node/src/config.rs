//! # Node Configuration
//!
//! What the gateway deploys at startup: ledgers, vaults on top of them, and
//! faucet balances of the in-memory base asset. Loaded from a JSON file, or
//! the built-in devnet layout when no file is given.
//!
//! ```json
//! {
//!   "network": "devnet",
//!   "decryption_timeout_secs": 300,
//!   "ledgers": [
//!     { "label": "cUSD", "name": "Confidential USD", "symbol": "cUSD",
//!       "underlying": "USD", "underlying_decimals": 6 }
//!   ],
//!   "vaults": [ { "label": "main", "owner": "0x…", "asset": "cUSD" } ],
//!   "faucet": [ { "asset": "USD", "account": "0x…", "amount": 1000000000 } ]
//! }
//! ```

use anyhow::{bail, Context, Result};
use cloak_contracts::ledger::LedgerSpec;
use cloak_contracts::{InMemoryBaseAsset, Runtime, RuntimeConfig};
use cloak_protocol::config::DEFAULT_DECRYPTION_TIMEOUT;
use cloak_protocol::crypto::CloakPublicKey;
use cloak_protocol::{Address, CiphertextStore, Clock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

fn default_network() -> String {
    "devnet".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_DECRYPTION_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_timeout")]
    pub decryption_timeout_secs: u64,
    #[serde(default)]
    pub ledgers: Vec<LedgerConfig>,
    #[serde(default)]
    pub vaults: Vec<VaultConfig>,
    #[serde(default)]
    pub faucet: Vec<FaucetGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub label: String,
    pub name: String,
    pub symbol: String,
    pub underlying: String,
    pub underlying_decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    pub label: String,
    pub owner: Address,
    /// Label of the ledger the vault holds.
    pub asset: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaucetGrant {
    /// Base asset identifier, e.g. `USD`.
    pub asset: String,
    pub account: Address,
    pub amount: u64,
}

impl NodeConfig {
    /// One 6-decimal USD ledger, one vault, and a funded demo account.
    pub fn devnet() -> Self {
        Self {
            network: default_network(),
            decryption_timeout_secs: default_timeout(),
            ledgers: vec![LedgerConfig {
                label: "cUSD".into(),
                name: "Confidential USD".into(),
                symbol: "cUSD".into(),
                underlying: "USD".into(),
                underlying_decimals: 6,
            }],
            vaults: vec![VaultConfig {
                label: "main".into(),
                owner: Address::derive("devnet:operator"),
                asset: "cUSD".into(),
            }],
            faucet: vec![FaucetGrant {
                asset: "USD".into(),
                account: Address::derive("devnet:alice"),
                amount: 1_000_000_000,
            }],
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Labels must be unique and every vault must name a configured ledger.
    pub fn validate(&self) -> Result<()> {
        let mut ledgers = BTreeSet::new();
        for ledger in &self.ledgers {
            if !ledgers.insert(ledger.label.as_str()) {
                bail!("duplicate ledger label {:?}", ledger.label);
            }
        }
        let mut vaults = BTreeSet::new();
        for vault in &self.vaults {
            if !vaults.insert(vault.label.as_str()) {
                bail!("duplicate vault label {:?}", vault.label);
            }
            if !ledgers.contains(vault.asset.as_str()) {
                bail!(
                    "vault {:?} holds unknown ledger {:?}",
                    vault.label,
                    vault.asset
                );
            }
        }
        if self.decryption_timeout_secs == 0 {
            bail!("decryption_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Mint the faucet, start a runtime, and deploy everything configured.
    pub fn build_runtime(
        &self,
        store: CiphertextStore,
        responder_key: CloakPublicKey,
        clock: Arc<dyn Clock>,
    ) -> Result<Runtime> {
        self.validate()?;

        let mut base = InMemoryBaseAsset::new();
        for grant in &self.faucet {
            base.mint(&grant.asset, &grant.account, grant.amount)
                .with_context(|| format!("failed to fund {}", grant.account))?;
        }

        let runtime = Runtime::new(
            RuntimeConfig {
                responder_key,
                decryption_timeout_secs: self.decryption_timeout_secs,
            },
            store,
            Box::new(base),
            clock,
        );

        for ledger in &self.ledgers {
            let spec = LedgerSpec::for_underlying(
                ledger.label.clone(),
                ledger.name.clone(),
                ledger.symbol.clone(),
                ledger.underlying.clone(),
                ledger.underlying_decimals,
            )
            .with_context(|| format!("invalid ledger {:?}", ledger.label))?;
            runtime
                .deploy_ledger(spec)
                .with_context(|| format!("failed to deploy ledger {:?}", ledger.label))?;
        }
        for vault in &self.vaults {
            let asset = Address::derive(&format!("ledger:{}", vault.asset));
            runtime
                .deploy_vault(&vault.label, vault.owner, asset)
                .with_context(|| format!("failed to deploy vault {:?}", vault.label))?;
        }
        Ok(runtime)
    }
}


/// A devnet runtime on a caller-supplied clock, with the responder that
/// answers for it.
#[cfg(test)]
pub(crate) fn devnet_fixture(
    clock: Arc<dyn Clock>,
) -> (Arc<Runtime>, cloak_protocol::TrustedResponder) {
    use cloak_protocol::crypto::{CloakKeypair, NetworkKey};

    let key = NetworkKey::generate();
    let responder = cloak_protocol::TrustedResponder::new(CloakKeypair::generate(), key.clone());
    let runtime = NodeConfig::devnet()
        .build_runtime(CiphertextStore::new(key), responder.public_key(), clock)
        .expect("devnet config deploys");
    (Arc::new(runtime), responder)
}

/// Queue one unwrap from the funded devnet account. Returns the ledger.
#[cfg(test)]
pub(crate) fn queue_unwrap(runtime: &Runtime) -> (Address, cloak_protocol::RequestId) {
    let ledger = Address::derive("ledger:cUSD");
    let alice = Address::derive("devnet:alice");
    runtime.wrap(ledger, alice, alice, 1_000).expect("wrap");
    let amount = runtime.encrypt_input(alice, 400).expect("input");
    let id = runtime
        .request_unwrap(ledger, alice, alice, alice, amount)
        .expect("unwrap request");
    (ledger, id)
}
