//! Opaque ciphertext handles and their typed wrappers.
//!
//! A handle is 32 bytes: 31 bytes of BLAKE3 output and a trailing kind tag.
//! Contracts hold [`EncryptedU64`] and [`EncryptedBool`], never raw handles,
//! so passing a boolean where an amount is expected does not compile. Neither
//! wrapper offers a way to read its value.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::config::HANDLE_LENGTH;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("invalid handle encoding: expected {HANDLE_LENGTH} hex-encoded bytes")]
    Malformed,

    #[error("handle carries unknown kind tag {0:#04x}")]
    UnknownKind(u8),

    #[error("handle kind mismatch: expected {expected}, found {actual}")]
    KindMismatch {
        expected: ValueKind,
        actual: ValueKind,
    },
}

/// What an encrypted value decodes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    U64,
}

impl ValueKind {
    pub fn tag(self) -> u8 {
        match self {
            ValueKind::Bool => 0x00,
            ValueKind::U64 => 0x05,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, HandleError> {
        match tag {
            0x00 => Ok(ValueKind::Bool),
            0x05 => Ok(ValueKind::U64),
            other => Err(HandleError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::U64 => write!(f, "u64"),
        }
    }
}

// ---------------------------------------------------------------------------
// CiphertextHandle
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CiphertextHandle([u8; HANDLE_LENGTH]);

impl CiphertextHandle {
    pub fn from_parts(prefix: [u8; HANDLE_LENGTH - 1], kind: ValueKind) -> Self {
        let mut bytes = [0u8; HANDLE_LENGTH];
        bytes[..HANDLE_LENGTH - 1].copy_from_slice(&prefix);
        bytes[HANDLE_LENGTH - 1] = kind.tag();
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; HANDLE_LENGTH]) -> Result<Self, HandleError> {
        ValueKind::from_tag(bytes[HANDLE_LENGTH - 1])?;
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, HandleError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let raw = hex::decode(s).map_err(|_| HandleError::Malformed)?;
        let bytes: [u8; HANDLE_LENGTH] =
            raw.as_slice().try_into().map_err(|_| HandleError::Malformed)?;
        Self::from_bytes(bytes)
    }

    pub fn kind(&self) -> ValueKind {
        // Constructors only admit known tags.
        match self.0[HANDLE_LENGTH - 1] {
            0x00 => ValueKind::Bool,
            _ => ValueKind::U64,
        }
    }

    pub fn as_bytes(&self) -> &[u8; HANDLE_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for CiphertextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CiphertextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form; full handles make logs unreadable.
        write!(f, "Handle({}:{})", hex::encode(&self.0[..6]), self.kind())
    }
}

impl Serialize for CiphertextHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for CiphertextHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Typed wrappers
// ---------------------------------------------------------------------------

macro_rules! typed_handle {
    ($name:ident, $kind:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(CiphertextHandle);

        impl $name {
            pub fn handle(&self) -> CiphertextHandle {
                self.0
            }

            pub(crate) fn wrap(handle: CiphertextHandle) -> Self {
                debug_assert_eq!(handle.kind(), $kind);
                Self(handle)
            }
        }

        impl TryFrom<CiphertextHandle> for $name {
            type Error = HandleError;

            fn try_from(handle: CiphertextHandle) -> Result<Self, Self::Error> {
                if handle.kind() != $kind {
                    return Err(HandleError::KindMismatch {
                        expected: $kind,
                        actual: handle.kind(),
                    });
                }
                Ok(Self(handle))
            }
        }

        impl From<$name> for CiphertextHandle {
            fn from(value: $name) -> CiphertextHandle {
                value.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let handle = CiphertextHandle::deserialize(deserializer)?;
                Self::try_from(handle).map_err(serde::de::Error::custom)
            }
        }
    };
}

typed_handle!(
    EncryptedU64,
    ValueKind::U64,
    "Handle to an encrypted unsigned 64-bit amount."
);
typed_handle!(
    EncryptedBool,
    ValueKind::Bool,
    "Handle to an encrypted boolean (the result of a comparison)."
);
