//! In-process replicated stores backed by Automerge documents
//!
//! Every address maps to one replica. A replica that was never created or
//! received from a peer reads as `None` until it appears. Keys are stored flat
//! on the document root (`k:` for map keys, `e:` for collection entries, `t:`
//! for tombstones) so that replicas created independently merge cleanly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use automerge::{transaction::Transactable, AutoCommit, ReadDoc, ROOT};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};
use ulid::Generator;

use super::registry::{StoreBackend, StoreHandle, WriteOutcome};
use super::{Address, Entry, Fingerprint, Snapshot, StoreData, StoreOp, StoreShape, Value};
use crate::error::{Error, Result};

const KEY_PREFIX: &str = "k:";
const ENTRY_PREFIX: &str = "e:";
const TOMBSTONE_PREFIX: &str = "t:";

struct Replica {
    address: Address,
    shape: StoreShape,
    doc: Mutex<Option<AutoCommit>>,
    tx: watch::Sender<Option<Arc<Snapshot>>>,
}

impl Replica {
    fn new(address: Address, shape: StoreShape) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            address,
            shape,
            doc: Mutex::new(None),
            tx,
        }
    }

    fn publish(&self, doc: &mut AutoCommit) -> Result<Fingerprint> {
        let snapshot = materialize(self.address, self.shape, doc)?;
        let heads = snapshot.heads;
        self.tx.send_replace(Some(Arc::new(snapshot)));
        Ok(heads)
    }

    fn apply(&self, op: StoreOp, next_id: impl FnOnce() -> String) -> Result<WriteOutcome> {
        if op.shape() != self.shape {
            return Err(Error::ShapeMismatch {
                address: self.address,
                actual: self.shape,
                expected: op.shape(),
            });
        }

        let mut guard = self.doc.lock();
        let doc = guard.get_or_insert_with(AutoCommit::new);
        let mut entry_id = None;

        match op {
            StoreOp::Put { key, value } => {
                let json = serde_json::to_string(&value)?;
                doc.put(ROOT, format!("{KEY_PREFIX}{key}"), json)
                    .map_err(|e| Error::Store(e.to_string()))?;
            }
            StoreOp::Delete { key } => {
                doc.delete(ROOT, format!("{KEY_PREFIX}{key}"))
                    .map_err(|e| Error::Store(e.to_string()))?;
            }
            StoreOp::Append { value } => {
                let id = next_id();
                let json = serde_json::to_string(&value)?;
                doc.put(ROOT, format!("{ENTRY_PREFIX}{id}"), json)
                    .map_err(|e| Error::Store(e.to_string()))?;
                entry_id = Some(id);
            }
            StoreOp::Remove { id } => {
                doc.put(ROOT, format!("{TOMBSTONE_PREFIX}{id}"), true)
                    .map_err(|e| Error::Store(e.to_string()))?;
            }
        }

        let heads = self.publish(doc)?;
        trace!(address = %self.address, "Replica written");
        Ok(WriteOutcome { heads, entry_id })
    }
}

fn materialize(address: Address, shape: StoreShape, doc: &mut AutoCommit) -> Result<Snapshot> {
    let mut heads: Vec<[u8; 32]> = doc.get_heads().into_iter().map(|h| h.0).collect();
    heads.sort_unstable();
    let heads = Fingerprint::of(heads.iter().map(|h| &h[..]));

    let mut values = BTreeMap::new();
    let mut tombstones = Vec::new();
    for key in doc.keys(ROOT) {
        if let Some(id) = key.strip_prefix(TOMBSTONE_PREFIX) {
            tombstones.push(id.to_string());
            continue;
        }
        if let Some((value, _)) = doc.get(ROOT, key.as_str()).map_err(|e| Error::Store(e.to_string()))? {
            let json = value
                .to_str()
                .ok_or_else(|| Error::Serialization(format!("{key} is not a string")))?;
            let value: Value = serde_json::from_str(json)?;
            values.insert(key, value);
        }
    }

    let data = match shape {
        StoreShape::KeyValue => StoreData::KeyValue(
            values
                .into_iter()
                .filter_map(|(k, v)| k.strip_prefix(KEY_PREFIX).map(|k| (k.to_string(), v)))
                .collect(),
        ),
        StoreShape::Collection => StoreData::Collection(
            // BTreeMap order is entry-id order, which is append order.
            values
                .into_iter()
                .filter_map(|(k, value)| {
                    let id = k.strip_prefix(ENTRY_PREFIX)?;
                    if tombstones.iter().any(|t| t == id) {
                        return None;
                    }
                    Some(Entry {
                        id: id.to_string(),
                        value,
                    })
                })
                .collect(),
        ),
    };

    Ok(Snapshot {
        address,
        shape,
        data,
        heads,
    })
}

struct MemoryHandle {
    replica: Arc<Replica>,
    backend: MemoryBackend,
}

impl StoreHandle for MemoryHandle {
    fn address(&self) -> Address {
        self.replica.address
    }

    fn shape(&self) -> StoreShape {
        self.replica.shape
    }

    fn read(&self) -> Option<Arc<Snapshot>> {
        self.replica.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.replica.tx.subscribe()
    }

    fn write(&self, op: StoreOp) -> Result<WriteOutcome> {
        self.replica.apply(op, || self.backend.next_entry_id())
    }
}

struct BackendInner {
    replicas: Mutex<HashMap<Address, Arc<Replica>>>,
    ids: Mutex<Generator>,
    open_calls: Mutex<HashMap<Address, usize>>,
}

/// In-process store backend
///
/// Cloning shares the same replicas. Two backends model two peers; use
/// [`MemoryBackend::merge_from`] to replicate between them.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<BackendInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BackendInner {
                replicas: Mutex::new(HashMap::new()),
                ids: Mutex::new(Generator::new()),
                open_calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn replica(&self, address: Address, shape: StoreShape) -> Result<Arc<Replica>> {
        let mut replicas = self.inner.replicas.lock();
        let replica = replicas
            .entry(address)
            .or_insert_with(|| Arc::new(Replica::new(address, shape)))
            .clone();
        if replica.shape != shape {
            return Err(Error::ShapeMismatch {
                address,
                actual: replica.shape,
                expected: shape,
            });
        }
        Ok(replica)
    }

    fn next_entry_id(&self) -> String {
        let mut ids = self.inner.ids.lock();
        ids.generate()
            .unwrap_or_else(|_| ulid::Ulid::new())
            .to_string()
    }

    /// Make a store reachable with empty content
    pub fn create(&self, address: Address, shape: StoreShape) -> Result<()> {
        let replica = self.replica(address, shape)?;
        let mut guard = replica.doc.lock();
        if guard.is_none() {
            let doc = guard.insert(AutoCommit::new());
            replica.publish(doc)?;
            debug!(%address, %shape, "Replica created");
        }
        Ok(())
    }

    /// Apply a write directly to a local replica
    pub fn write(&self, address: Address, shape: StoreShape, op: StoreOp) -> Result<WriteOutcome> {
        let replica = self.replica(address, shape)?;
        replica.apply(op, || self.next_entry_id())
    }

    /// Current content of a local replica, `None` if unknown
    pub fn read(&self, address: &Address) -> Option<Arc<Snapshot>> {
        let replicas = self.inner.replicas.lock();
        replicas.get(address).and_then(|r| r.tx.borrow().clone())
    }

    /// Merge every replica `other` knows into this backend
    ///
    /// Replicas unknown here become reachable; known ones are CRDT-merged.
    /// Returns the number of replicas whose content changed.
    pub fn merge_from(&self, other: &MemoryBackend) -> Result<usize> {
        let theirs: Vec<Arc<Replica>> = other.inner.replicas.lock().values().cloned().collect();
        let mut changed = 0;

        for remote in theirs {
            let Some(forked) = remote.doc.lock().as_mut().map(|d| d.fork()) else {
                continue;
            };
            if self.merge_doc(remote.address, remote.shape, forked)? {
                changed += 1;
            }
        }

        debug!(changed, "Merged replicas from peer");
        Ok(changed)
    }

    /// Merge `incoming` into the local replica of `address`
    ///
    /// The incoming document must materialize as a store of `shape` before
    /// anything local is touched. Returns whether the content changed.
    fn merge_doc(&self, address: Address, shape: StoreShape, mut incoming: AutoCommit) -> Result<bool> {
        materialize(address, shape, &mut incoming)?;
        let local = self.replica(address, shape)?;
        let mut guard = local.doc.lock();
        let before = guard.as_mut().map(|d| d.get_heads());
        match guard.as_mut() {
            Some(doc) => {
                doc.merge(&mut incoming)
                    .map_err(|e| Error::Store(e.to_string()))?;
            }
            None => *guard = Some(incoming),
        }
        let Some(doc) = guard.as_mut() else {
            return Ok(false);
        };
        if before.as_ref() == Some(&doc.get_heads()) {
            return Ok(false);
        }
        local.publish(doc)?;
        Ok(true)
    }

    /// How many times `address` was opened through this backend
    pub fn open_calls(&self, address: &Address) -> usize {
        self.inner.open_calls.lock().get(address).copied().unwrap_or(0)
    }
}

impl StoreBackend for MemoryBackend {
    fn open(&self, address: Address, shape: StoreShape) -> BoxFuture<'_, Result<Arc<dyn StoreHandle>>> {
        Box::pin(async move {
            let replica = self.replica(address, shape)?;
            *self.inner.open_calls.lock().entry(address).or_insert(0) += 1;
            let handle: Arc<dyn StoreHandle> = Arc::new(MemoryHandle {
                replica,
                backend: self.clone(),
            });
            Ok(handle)
        })
    }
    fn export(&self, address: &Address) -> Option<(StoreShape, Vec<u8>)> {
        let replica = self.inner.replicas.lock().get(address).cloned()?;
        let bytes = replica.doc.lock().as_mut().map(|d| d.save())?;
        Some((replica.shape, bytes))
    }

    fn import(&self, address: Address, shape: StoreShape, data: &[u8]) -> Result<bool> {
        let incoming = AutoCommit::load(data).map_err(|e| Error::Store(e.to_string()))?;
        let changed = self.merge_doc(address, shape, incoming)?;
        if changed {
            debug!(%address, %shape, "Imported replica");
        }
        Ok(changed)
    }
}
