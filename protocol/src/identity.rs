//! # Account Addresses
//!
//! A 20-byte identity for users and contracts alike. User addresses are
//! supplied by whatever wallet layer sits above Cloak; contract addresses are
//! derived from a deployment label so that the same devnet config always
//! yields the same addresses.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::{ADDRESS_DOMAIN, ADDRESS_LENGTH};
use crate::crypto::hash::derive;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid address: expected 0x followed by {} hex characters", ADDRESS_LENGTH * 2)]
    Malformed,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LENGTH]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    pub fn from_bytes(bytes: [u8; ADDRESS_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Deterministic address for a named account or contract.
    pub fn derive(label: &str) -> Self {
        let digest = derive(ADDRESS_DOMAIN, &[label.as_bytes()]);
        let mut bytes = [0u8; ADDRESS_LENGTH];
        bytes.copy_from_slice(&digest[..ADDRESS_LENGTH]);
        Self(bytes)
    }

    /// Parse `0x`-prefixed (or bare) hex.
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let raw = hex::decode(s).map_err(|_| AddressError::Malformed)?;
        let bytes: [u8; ADDRESS_LENGTH] =
            raw.as_slice().try_into().map_err(|_| AddressError::Malformed)?;
        Ok(Self(bytes))
    }

    /// Interpret callback data as an address, if it is exactly 20 bytes.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; ADDRESS_LENGTH] = data.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic_and_distinct() {
        assert_eq!(Address::derive("ledger:cUSD"), Address::derive("ledger:cUSD"));
        assert_ne!(Address::derive("ledger:cUSD"), Address::derive("vault:cUSD"));
        assert_ne!(Address::derive("alice"), Address::ZERO);
    }

    #[test]
    fn hex_display_and_parse() {
        let a = Address::derive("alice");
        let shown = a.to_string();
        assert!(shown.starts_with("0x"));
        assert_eq!(shown.len(), 42);
        assert_eq!(shown.parse::<Address>().unwrap(), a);
        assert_eq!(Address::from_hex(&shown[2..]).unwrap(), a);
        assert!(Address::from_hex("0x1234").is_err());
        assert!(Address::from_hex("not hex").is_err());
    }

    #[test]
    fn from_slice_requires_exact_length() {
        let a = Address::derive("bob");
        assert_eq!(Address::from_slice(a.as_bytes()), Some(a));
        assert_eq!(Address::from_slice(&[1u8; 19]), None);
        assert_eq!(Address::from_slice(&[]), None);
    }

    #[test]
    fn serde_as_hex_string() {
        let a = Address::derive("carol");
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{}\"", a));
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), a);
    }
}
