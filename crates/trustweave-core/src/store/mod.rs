//! Replicated store layer
//!
//! Stores are addressed by an immutable, content-derived [`Address`] and come
//! in two shapes: single-value key/value maps and append-only collections with
//! tombstone deletion. The data behind an address mutates; the address never
//! does.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  StoreRegistry (ref-counted pool of open handles)               │
//! │  ├── per-address open guard (one live handle per address)      │
//! │  └── StoreLease (released on drop)                             │
//! │                                                                 │
//! │  StoreBackend (opens handles)                                   │
//! │  └── MemoryBackend (Automerge replicas, in-process)            │
//! │                                                                 │
//! │  StoreHandle                                                    │
//! │  ├── read()  -> Option<Arc<Snapshot>>                          │
//! │  ├── watch() -> latest-value change notification               │
//! │  └── write(StoreOp)                                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cross-references between stores are explicit [`Value::Ref`] values, so
//! graph walkers never have to guess whether a string is an address.

mod memory;
mod registry;
mod value;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

pub use memory::MemoryBackend;
pub use registry::{StoreBackend, StoreHandle, StoreLease, StoreRegistry, WriteOutcome};
pub use value::{Entry, Snapshot, StoreData, StoreOp, Value};

/// Content-derived identifier of a replicated store
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 32]);

impl Address {
    /// Create an address from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the address of content from its bytes
    pub fn from_content(content: &[u8]) -> Self {
        Self(*blake3::hash(content).as_bytes())
    }

    /// Derive a well-known address for a namespace and owner
    ///
    /// Used for the per-account stores (trust, favorites, documents, devices)
    /// so that any peer can compute where another account keeps them.
    pub fn derive(namespace: &str, owner: impl AsRef<str>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"trustweave:store:");
        hasher.update(namespace.as_bytes());
        hasher.update(b":");
        hasher.update(owner.as_ref().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Get the raw bytes of the address
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to base58 string for display/storage
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from base58 string
    pub fn from_base58(s: &str) -> Result<Self, Error> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", s, e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidAddress(format!("{}: expected 32 bytes", s)))?;
        Ok(Self(arr))
    }
}

/// Check whether a string is a well-formed store address
pub fn is_valid_address(s: &str) -> bool {
    Address::from_base58(s).is_ok()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", bs58::encode(&self.0[..8]).into_string())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base58(&s).map_err(serde::de::Error::custom)
    }
}

/// Declared shape of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreShape {
    /// Single-value map from string keys to values
    KeyValue,
    /// Append-only list of entries, deletion by tombstone
    Collection,
}

impl fmt::Display for StoreShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreShape::KeyValue => write!(f, "key-value"),
            StoreShape::Collection => write!(f, "collection"),
        }
    }
}

/// Typed reference to a store: where it lives and what shape it has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreRef {
    /// Address of the referenced store
    pub address: Address,
    /// Declared shape of the referenced store
    pub shape: StoreShape,
}

impl StoreRef {
    /// Reference a key/value store
    pub fn key_value(address: Address) -> Self {
        Self {
            address,
            shape: StoreShape::KeyValue,
        }
    }

    /// Reference a collection store
    pub fn collection(address: Address) -> Self {
        Self {
            address,
            shape: StoreShape::Collection,
        }
    }
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shape, self.address)
    }
}

/// Content fingerprint of a store or a set of stores
///
/// Two fingerprints are equal iff the underlying replica heads are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Fingerprint of a sequence of byte chunks, order-sensitive
    pub fn of<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for chunk in chunks {
            hasher.update(&(chunk.len() as u32).to_le_bytes());
            hasher.update(chunk);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..6]))
    }
}
