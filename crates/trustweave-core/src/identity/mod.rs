//! Account and device identity
//!
//! Accounts and devices each hold an Ed25519 keypair. Their identifiers are
//! the base58 form of the verification key, so any id can be turned back into
//! the key that verifies its signatures.
//!
//! ## Device binding
//!
//! ```text
//!   account key ──signs──> device id           (account authorizes device)
//!   device key  ──signs──> account id || key   (device binds to account)
//!   devices store of the account lists the device id
//! ```
//!
//! A device record is only trusted when both signatures verify and the
//! account's authorization store lists it.

mod device;
mod keys;

pub use device::{
    authorize_device, devices_store, is_device_authorized, revoke_device,
    track_device_authorized, Device, DeviceSignatures, LocalIdentity,
};
pub use keys::{
    verify, AccountId, AccountKeypair, DeviceId, DeviceKeypair, Keypair, PublicKey, Signature,
    Signer,
};

use crate::track::{DedupCode, DynamicBranch};

impl DynamicBranch for AccountId {
    fn dedup_code(&self) -> Option<DedupCode> {
        Some(self.to_string())
    }
}
