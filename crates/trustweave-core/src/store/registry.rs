//! Reference-counted pool of open store handles

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{Address, Fingerprint, Snapshot, StoreOp, StoreShape};
use crate::error::{Error, Result};

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Replica heads after the write
    pub heads: Fingerprint,
    /// Id of the appended entry, for [`StoreOp::Append`]
    pub entry_id: Option<String>,
}

/// An open replicated store
///
/// `read` returns `None` while the store is not reachable yet; watchers are
/// notified the moment it becomes reachable and on every later change.
pub trait StoreHandle: Send + Sync {
    /// Address of the store
    fn address(&self) -> Address;

    /// Shape the store was opened with
    fn shape(&self) -> StoreShape;

    /// Point-in-time read of the current state
    fn read(&self) -> Option<Arc<Snapshot>>;

    /// Change notification holding the latest state
    ///
    /// Intermediate states may be skipped when the receiver falls behind;
    /// the writer is never blocked by a slow receiver.
    fn watch(&self) -> watch::Receiver<Option<Arc<Snapshot>>>;

    /// Apply a mutation
    fn write(&self, op: StoreOp) -> Result<WriteOutcome>;
}

/// Opens store handles by address
pub trait StoreBackend: Send + Sync {
    /// Open the store at `address` with the declared `shape`
    fn open(&self, address: Address, shape: StoreShape)
        -> BoxFuture<'_, Result<Arc<dyn StoreHandle>>>;

    /// Encoded full state of a local replica, `None` if unknown here
    fn export(&self, _address: &Address) -> Option<(StoreShape, Vec<u8>)> {
        None
    }

    /// Merge an encoded replica received from a peer
    ///
    /// Returns whether the local content changed.
    fn import(&self, address: Address, _shape: StoreShape, _data: &[u8]) -> Result<bool> {
        Err(Error::Store(format!("backend cannot import {}", address)))
    }
}

struct Slot {
    shape: StoreShape,
    handle: tokio::sync::Mutex<Option<Arc<dyn StoreHandle>>>,
}

struct SlotEntry {
    refs: usize,
    slot: Arc<Slot>,
}

struct RegistryInner {
    backend: Arc<dyn StoreBackend>,
    slots: Mutex<HashMap<Address, SlotEntry>>,
}

impl RegistryInner {
    fn release(&self, address: &Address) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(address) {
            entry.refs -= 1;
            if entry.refs == 0 {
                slots.remove(address);
                debug!(%address, "Store handle released");
            }
        }
    }
}

/// Shared pool of open store handles
///
/// Trackers that open the same address concurrently share one handle. The
/// handle is dropped when the last [`StoreLease`] for it is dropped.
#[derive(Clone)]
pub struct StoreRegistry {
    inner: Arc<RegistryInner>,
}

impl StoreRegistry {
    /// Create a registry over a backend
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open `address`, or reuse the handle that is already open
    pub async fn acquire(&self, address: Address, shape: StoreShape) -> Result<StoreLease> {
        let slot = {
            let mut slots = self.inner.slots.lock();
            let entry = slots.entry(address).or_insert_with(|| SlotEntry {
                refs: 0,
                slot: Arc::new(Slot {
                    shape,
                    handle: tokio::sync::Mutex::new(None),
                }),
            });
            if entry.slot.shape != shape {
                let actual = entry.slot.shape;
                if entry.refs == 0 {
                    slots.remove(&address);
                }
                return Err(Error::ShapeMismatch {
                    address,
                    actual,
                    expected: shape,
                });
            }
            entry.refs += 1;
            entry.slot.clone()
        };

        // Holds the reference while the open is in flight, so a cancelled
        // acquire does not leak it.
        let guard = LeaseGuard {
            registry: self.inner.clone(),
            address,
        };

        let mut open = slot.handle.lock().await;
        let handle = if let Some(existing) = open.clone() {
            existing
        } else {
            let opened = self.inner.backend.open(address, shape).await?;
            debug!(%address, %shape, "Store handle opened");
            *open = Some(opened.clone());
            opened
        };
        drop(open);
        trace!(%address, "Store lease acquired");

        Ok(StoreLease {
            handle,
            _guard: guard,
        })
    }

    /// Open a store, apply one write and release it again
    pub async fn write(&self, address: Address, shape: StoreShape, op: StoreOp) -> Result<WriteOutcome> {
        let lease = self.acquire(address, shape).await?;
        lease.write(op)
    }

    /// Read the current state of a store once
    pub async fn read(&self, address: Address, shape: StoreShape) -> Result<Option<Arc<Snapshot>>> {
        let lease = self.acquire(address, shape).await?;
        Ok(lease.read())
    }

    /// Encoded state of a replica, for sending to peers
    pub fn export(&self, address: &Address) -> Option<(StoreShape, Vec<u8>)> {
        self.inner.backend.export(address)
    }

    /// Merge a replica received from a peer
    pub fn import(&self, address: Address, shape: StoreShape, data: &[u8]) -> Result<bool> {
        self.inner.backend.import(address, shape, data)
    }

    /// Whether a handle for `address` is currently held by anyone
    pub fn is_open(&self, address: &Address) -> bool {
        self.inner.slots.lock().contains_key(address)
    }

    /// Number of addresses with a live handle
    pub fn open_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Number of leases held on `address`
    pub fn lease_count(&self, address: &Address) -> usize {
        self.inner
            .slots
            .lock()
            .get(address)
            .map(|e| e.refs)
            .unwrap_or(0)
    }
}

struct LeaseGuard {
    registry: Arc<RegistryInner>,
    address: Address,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.registry.release(&self.address);
    }
}

/// A held reference to an open store handle
pub struct StoreLease {
    handle: Arc<dyn StoreHandle>,
    _guard: LeaseGuard,
}

impl std::ops::Deref for StoreLease {
    type Target = dyn StoreHandle;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref()
    }
}

impl std::fmt::Debug for StoreLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLease")
            .field("address", &self.handle.address())
            .field("shape", &self.handle.shape())
            .finish()
    }
}
