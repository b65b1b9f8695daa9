//! # Base Asset
//!
//! The plaintext token a confidential ledger wraps. Cloak doesn't implement
//! it; it talks to it through [`BaseAsset`]. Wrapping escrows base units into
//! the ledger's account, claiming an unwrap releases them back out.
//!
//! [`InMemoryBaseAsset`] backs tests and the devnet gateway, where its
//! [`mint`](InMemoryBaseAsset::mint) plays faucet.

use cloak_protocol::Address;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BaseAssetError {
    #[error("insufficient {asset} funds for {account}: required {required}, available {available}")]
    InsufficientFunds {
        asset: String,
        account: Address,
        required: u64,
        available: u64,
    },

    #[error("{asset} balance overflow for {account}")]
    Overflow { asset: String, account: Address },
}

pub trait BaseAsset: Send {
    fn balance_of(&self, asset: &str, account: &Address) -> u64;

    /// Move `amount` of `asset` from `from` into `holder`'s custody.
    fn escrow(
        &mut self,
        asset: &str,
        from: &Address,
        holder: &Address,
        amount: u64,
    ) -> Result<(), BaseAssetError>;

    /// Move `amount` of `asset` out of `holder`'s custody to `to`.
    fn release(
        &mut self,
        asset: &str,
        holder: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<(), BaseAssetError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryBaseAsset {
    balances: HashMap<(String, Address), u64>,
}

impl InMemoryBaseAsset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` out of thin air.
    pub fn mint(&mut self, asset: &str, to: &Address, amount: u64) -> Result<(), BaseAssetError> {
        let entry = self.balances.entry((asset.to_string(), *to)).or_insert(0);
        *entry = entry
            .checked_add(amount)
            .ok_or_else(|| BaseAssetError::Overflow {
                asset: asset.to_string(),
                account: *to,
            })?;
        Ok(())
    }

    /// Sum of all balances of `asset`.
    pub fn total(&self, asset: &str) -> u128 {
        self.balances
            .iter()
            .filter(|((a, _), _)| a == asset)
            .map(|(_, v)| *v as u128)
            .sum()
    }

    fn move_funds(
        &mut self,
        asset: &str,
        from: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<(), BaseAssetError> {
        let available = self.balance_of(asset, from);
        if available < amount {
            return Err(BaseAssetError::InsufficientFunds {
                asset: asset.to_string(),
                account: *from,
                required: amount,
                available,
            });
        }
        if from == to || amount == 0 {
            return Ok(());
        }
        let to_balance = self.balance_of(asset, to);
        let credited = to_balance
            .checked_add(amount)
            .ok_or_else(|| BaseAssetError::Overflow {
                asset: asset.to_string(),
                account: *to,
            })?;
        self.balances
            .insert((asset.to_string(), *from), available - amount);
        self.balances.insert((asset.to_string(), *to), credited);
        Ok(())
    }
}

impl BaseAsset for InMemoryBaseAsset {
    fn balance_of(&self, asset: &str, account: &Address) -> u64 {
        self.balances
            .get(&(asset.to_string(), *account))
            .copied()
            .unwrap_or(0)
    }

    fn escrow(
        &mut self,
        asset: &str,
        from: &Address,
        holder: &Address,
        amount: u64,
    ) -> Result<(), BaseAssetError> {
        self.move_funds(asset, from, holder, amount)
    }

    fn release(
        &mut self,
        asset: &str,
        holder: &Address,
        to: &Address,
        amount: u64,
    ) -> Result<(), BaseAssetError> {
        self.move_funds(asset, holder, to, amount)
    }
}
