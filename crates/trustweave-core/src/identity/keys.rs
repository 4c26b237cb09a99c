//! Ed25519 keys, signatures and the identifiers derived from them

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature as Ed25519Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Ed25519 verification key, base58 on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse from raw bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| Error::Identity(format!("Invalid public key: {}", e)))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Base58 form
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0.as_bytes()).into_string()
    }

    /// Parse the base58 form
    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::Identity(format!("Invalid base58 key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Identity("Public key must be 32 bytes".to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Verify `signature` over `message`
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify(message, &signature.0).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base58())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base58(&s).map_err(serde::de::Error::custom)
    }
}

/// Ed25519 signature, base58 on the wire
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(Ed25519Signature);

impl Signature {
    /// Base58 form
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0.to_bytes()).into_string()
    }

    /// Parse the base58 form
    pub fn from_base58(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::Identity(format!("Invalid base58 signature: {}", e)))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| Error::Identity("Signature must be 64 bytes".to_string()))?;
        Ok(Self(Ed25519Signature::from_bytes(&bytes)))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_base58();
        write!(f, "Signature({}..)", &text[..text.len().min(8)])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base58())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base58(&s).map_err(serde::de::Error::custom)
    }
}

/// Anything that can produce signatures
pub trait Signer {
    /// Sign `message`
    fn sign(&self, message: &[u8]) -> Signature;

    /// Key that verifies this signer's signatures
    fn public_key(&self) -> PublicKey;
}

/// Verify `signature` over `message` against `public_key`
pub fn verify(signature: &Signature, message: &[u8], public_key: &PublicKey) -> bool {
    public_key.verify(message, signature)
}

/// Ed25519 signing keypair
pub struct Keypair {
    signing: SigningKey,
}

/// Keypair that owns an account
pub type AccountKeypair = Keypair;

/// Keypair of one device of an account
pub type DeviceKeypair = Keypair;

impl Keypair {
    /// Generate a new random keypair
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| Error::Identity(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self::from_seed(&seed))
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Secret seed, for persistence
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Restore a keypair from its secret seed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Identity("Keypair data must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Account id of this key
    pub fn account_id(&self) -> AccountId {
        AccountId::from_public_key(&self.public_key())
    }

    /// Device id of this key
    pub fn device_id(&self) -> DeviceId {
        DeviceId::from_public_key(&self.public_key())
    }
}

impl Signer for Keypair {
    fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message))
    }

    fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

macro_rules! key_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Identifier of the holder of `key`
            pub fn from_public_key(key: &PublicKey) -> Self {
                Self(key.to_base58())
            }

            /// Parse and validate an identifier
            pub fn parse(s: &str) -> Result<Self> {
                PublicKey::from_base58(s)
                    .map(|key| Self::from_public_key(&key))
                    .map_err(|_| Error::InvalidId(format!("{} {:?}", $label, s)))
            }

            /// Verification key the identifier encodes
            pub fn public_key(&self) -> Result<PublicKey> {
                PublicKey::from_base58(&self.0)
            }

            /// The identifier text
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Shortened form for logs and tables
            pub fn short(&self) -> &str {
                &self.0[..self.0.len().min(8)]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                Self::parse(&s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

key_id!(
    /// Identifier of an account: base58 of its verification key
    AccountId,
    "account id"
);

key_id!(
    /// Identifier of a device: base58 of its verification key
    DeviceId,
    "device id"
);
