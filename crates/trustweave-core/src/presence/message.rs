//! Signed presence envelopes
//!
//! Wire format (JSON):
//!
//! ```text
//! {
//!   "signature": { "signature": <base58>, "publicKey": <base58> },
//!   "value": {
//!     "type": "presence",
//!     "content": { "deviceId", "accountId", "publicKey", "signatures" }
//!   }
//! }
//! ```
//!
//! The envelope signature covers the JSON encoding of `value`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::{Device, DeviceId, LocalIdentity, PublicKey, Signature, Signer};

/// Payload carried by an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum PresenceMessage {
    /// A device announcing it is online
    Presence(Device),
}

impl PresenceMessage {
    /// The announced device
    pub fn device(&self) -> &Device {
        match self {
            PresenceMessage::Presence(device) => device,
        }
    }
}

/// Signature block of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeSignature {
    pub signature: Signature,
    pub public_key: PublicKey,
}

/// A message signed by the device that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub signature: EnvelopeSignature,
    pub value: PresenceMessage,
}

impl SignedEnvelope {
    /// Sign a presence announcement for the local device
    pub fn presence(identity: &LocalIdentity) -> Result<Self> {
        let value = PresenceMessage::Presence(identity.current_device().clone());
        let bytes = serde_json::to_vec(&value)?;
        Ok(Self {
            signature: EnvelopeSignature {
                signature: identity.sign(&bytes),
                public_key: identity.public_key(),
            },
            value,
        })
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Device that sent the envelope
    pub fn sender(&self) -> &DeviceId {
        &self.value.device().device_id
    }

    /// Check everything that can be checked without the authorization store
    ///
    /// - the signature verifies against the claimed key
    /// - the claimed key is the announced device's key
    /// - the device record cross-verifies with its account
    pub fn verify(&self) -> bool {
        let device = self.value.device();
        if self.signature.public_key != device.public_key {
            return false;
        }
        let Ok(bytes) = serde_json::to_vec(&self.value) else {
            return false;
        };
        self.signature
            .public_key
            .verify(&bytes, &self.signature.signature)
            && device.verify()
    }
}
