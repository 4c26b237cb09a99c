//! Device records, the local identity and device authorization

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::keys::{AccountId, DeviceId, Keypair, PublicKey, Signature, Signer};
use crate::error::{Error, Result};
use crate::storage::LocalStorage;
use crate::store::{Address, StoreOp, StoreRef, StoreRegistry, Value};
use crate::track::Track;

/// Cross-signatures binding a device to its account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSignatures {
    /// Account key's signature over the device id
    #[serde(rename = "deviceId")]
    pub of_device_id: Signature,
    /// Device key's signature over the account id and device key
    #[serde(rename = "publicKey")]
    pub of_public_key: Signature,
}

/// A device announcing itself on behalf of an account
///
/// Valid only if both signatures cross-verify and the account's
/// authorization store lists the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: DeviceId,
    pub account_id: AccountId,
    pub public_key: PublicKey,
    pub signatures: DeviceSignatures,
}

fn binding_message(account: &AccountId, key: &PublicKey) -> Vec<u8> {
    let mut message = account.as_str().as_bytes().to_vec();
    message.extend_from_slice(key.to_base58().as_bytes());
    message
}

impl Device {
    /// Create the record for `device`, authorized by `account`
    pub fn new(account: &Keypair, device: &Keypair) -> Self {
        let device_id = device.device_id();
        let account_id = account.account_id();
        let public_key = device.public_key();
        let signatures = DeviceSignatures {
            of_device_id: account.sign(device_id.as_str().as_bytes()),
            of_public_key: device.sign(&binding_message(&account_id, &public_key)),
        };
        Self {
            device_id,
            account_id,
            public_key,
            signatures,
        }
    }

    /// Check that the key matches the id and both signatures verify
    ///
    /// This does not consult the authorization store.
    pub fn verify(&self) -> bool {
        if DeviceId::from_public_key(&self.public_key) != self.device_id {
            return false;
        }
        let Ok(account_key) = self.account_id.public_key() else {
            return false;
        };
        account_key.verify(
            self.device_id.as_str().as_bytes(),
            &self.signatures.of_device_id,
        ) && self.public_key.verify(
            &binding_message(&self.account_id, &self.public_key),
            &self.signatures.of_public_key,
        )
    }
}

/// Keys of this device and the account it belongs to
pub struct LocalIdentity {
    account: Keypair,
    device: Keypair,
    record: Device,
}

impl LocalIdentity {
    /// Identity from existing keys
    pub fn from_keys(account: Keypair, device: Keypair) -> Self {
        let record = Device::new(&account, &device);
        Self {
            account,
            device,
            record,
        }
    }

    /// Fresh account with one device
    pub fn generate() -> Result<Self> {
        Ok(Self::from_keys(Keypair::generate()?, Keypair::generate()?))
    }

    /// Load the persisted identity, creating and saving one on first use
    pub fn load_or_create(storage: &LocalStorage) -> Result<Self> {
        if let Some(bytes) = storage.load_identity()? {
            if bytes.len() != 64 {
                return Err(Error::Identity("Stored identity is corrupt".to_string()));
            }
            let identity = Self::from_keys(
                Keypair::from_bytes(&bytes[..32])?,
                Keypair::from_bytes(&bytes[32..])?,
            );
            debug!(account = %identity.account_id(), "Loaded identity");
            return Ok(identity);
        }

        let identity = Self::generate()?;
        let mut bytes = identity.account.to_bytes().to_vec();
        bytes.extend_from_slice(&identity.device.to_bytes());
        storage.save_identity(&bytes)?;
        info!(account = %identity.account_id(), device = %identity.device_id(), "Created new identity");
        Ok(identity)
    }

    /// The signed record of this device
    pub fn current_device(&self) -> &Device {
        &self.record
    }

    pub fn account_id(&self) -> AccountId {
        self.record.account_id.clone()
    }

    pub fn device_id(&self) -> DeviceId {
        self.record.device_id.clone()
    }

    /// Account key, for signing on behalf of the whole account
    pub fn account_keys(&self) -> &Keypair {
        &self.account
    }
}

/// Signs with the device key
impl Signer for LocalIdentity {
    fn sign(&self, message: &[u8]) -> Signature {
        self.device.sign(message)
    }

    fn public_key(&self) -> PublicKey {
        self.device.public_key()
    }
}

/// Authorization store of `account`: device id -> `true`
pub fn devices_store(account: &AccountId) -> StoreRef {
    StoreRef::key_value(Address::derive("devices", account))
}

/// List `device` as authorized for `account`
pub async fn authorize_device(
    registry: &StoreRegistry,
    account: &AccountId,
    device: &DeviceId,
) -> Result<()> {
    let store = devices_store(account);
    registry
        .write(store.address, store.shape, StoreOp::put(device.as_str(), true))
        .await?;
    info!(%account, %device, "Device authorized");
    Ok(())
}

/// Remove `device` from `account`'s authorization store
pub async fn revoke_device(
    registry: &StoreRegistry,
    account: &AccountId,
    device: &DeviceId,
) -> Result<()> {
    let store = devices_store(account);
    registry
        .write(
            store.address,
            store.shape,
            StoreOp::Delete {
                key: device.to_string(),
            },
        )
        .await?;
    info!(%account, %device, "Device revoked");
    Ok(())
}

/// One-shot check of the authorization store
pub async fn is_device_authorized(
    registry: &StoreRegistry,
    account: &AccountId,
    device: &DeviceId,
) -> Result<bool> {
    let store = devices_store(account);
    let snapshot = registry.read(store.address, store.shape).await?;
    Ok(snapshot
        .and_then(|s| s.data.get(device.as_str()).and_then(Value::as_bool))
        .unwrap_or(false))
}

/// Live authorization status of a device
pub fn track_device_authorized(
    registry: &StoreRegistry,
    account: &AccountId,
    device: &DeviceId,
) -> Track<bool> {
    let key = device.to_string();
    Track::store(registry, devices_store(account)).map(move |snapshot| {
        snapshot
            .and_then(|s| s.data.get(&key).and_then(Value::as_bool))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::MemoryBackend;

    #[test]
    fn test_device_cross_verifies() {
        let identity = LocalIdentity::generate().unwrap();
        assert!(identity.current_device().verify());
    }

    #[test]
    fn test_tampered_device_rejected() {
        let identity = LocalIdentity::generate().unwrap();
        let intruder = LocalIdentity::generate().unwrap();

        // Claims another account
        let mut record = identity.current_device().clone();
        record.account_id = intruder.account_id();
        assert!(!record.verify());

        // Key does not match the id
        let mut record = identity.current_device().clone();
        record.public_key = intruder.public_key();
        assert!(!record.verify());
    }

    #[test]
    fn test_device_wire_shape() {
        let identity = LocalIdentity::generate().unwrap();
        let json = serde_json::to_value(identity.current_device()).unwrap();
        assert!(json["deviceId"].is_string());
        assert!(json["accountId"].is_string());
        assert!(json["publicKey"].is_string());
        assert!(json["signatures"]["deviceId"].is_string());
        assert!(json["signatures"]["publicKey"].is_string());
    }

    #[test]
    fn test_identity_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("local.redb");
        let first = {
            let storage = LocalStorage::new(&path).unwrap();
            LocalIdentity::load_or_create(&storage).unwrap().device_id()
        };
        let storage = LocalStorage::new(&path).unwrap();
        let second = LocalIdentity::load_or_create(&storage).unwrap();
        assert_eq!(first, second.device_id());
        assert!(second.current_device().verify());
    }

    #[tokio::test]
    async fn test_authorization_store() {
        let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
        let identity = LocalIdentity::generate().unwrap();
        let account = identity.account_id();
        let device = identity.device_id();

        assert!(!is_device_authorized(&registry, &account, &device).await.unwrap());
        authorize_device(&registry, &account, &device).await.unwrap();
        assert!(is_device_authorized(&registry, &account, &device).await.unwrap());
        revoke_device(&registry, &account, &device).await.unwrap();
        assert!(!is_device_authorized(&registry, &account, &device).await.unwrap());
    }
}
