//! Explicit trust edges and the private block list
//!
//! Trust edges live in the trustor's own replicated key-value store (one key
//! per target account, last write wins) and are readable by peers. Private
//! blocks live only in this device's local storage and are never broadcast.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::AccountId;
use crate::storage::LocalStorage;
use crate::store::{Address, Snapshot, StoreOp, StoreRef, StoreRegistry, Value};
use crate::track::Track;

/// Local-state key holding the private block list
pub const PRIVATE_BLOCKS_KEY: &str = "private-blocks";

/// Status of a trust edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Trusted,
    Blocked,
}

impl TrustStatus {
    /// Wire text
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustStatus::Trusted => "trusted",
            TrustStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trusted" => Ok(TrustStatus::Trusted),
            "blocked" => Ok(TrustStatus::Blocked),
            other => Err(Error::Serialization(format!("Unknown trust status: {}", other))),
        }
    }
}

/// A directional trust statement stored by the trustor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEdge {
    pub target: AccountId,
    pub status: TrustStatus,
}

/// Trust store of `account`
pub fn trust_store(account: &AccountId) -> StoreRef {
    StoreRef::key_value(Address::derive("trust", account))
}

/// Decode the edges in a trust store snapshot
///
/// Keys that are not account ids and values that are not a known status are
/// skipped; peers may write anything into their own store.
pub fn edges_from_snapshot(snapshot: &Snapshot) -> Vec<TrustEdge> {
    let crate::store::StoreData::KeyValue(map) = &snapshot.data else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(key, value)| {
            let target = AccountId::parse(key).ok()?;
            let status = value.as_text()?.parse().ok()?;
            Some(TrustEdge { target, status })
        })
        .collect()
}

/// Live trust edges of `account`, empty while the store is unknown
pub fn track_trust_edges(registry: &StoreRegistry, account: &AccountId) -> Track<Vec<TrustEdge>> {
    Track::store(registry, trust_store(account))
        .map(|snapshot| snapshot.map(|s| edges_from_snapshot(&s)).unwrap_or_default())
}

/// Writer for one account's trust store
#[derive(Clone)]
pub struct TrustStore {
    registry: StoreRegistry,
    account: AccountId,
}

impl TrustStore {
    pub fn new(registry: StoreRegistry, account: AccountId) -> Self {
        Self { registry, account }
    }

    /// Record `status` for `target`, replacing any previous edge
    pub async fn set_trust(&self, target: &AccountId, status: TrustStatus) -> Result<()> {
        if *target == self.account {
            return Err(Error::InvalidId(format!(
                "account {} cannot hold a trust edge to itself",
                target.short()
            )));
        }
        let store = trust_store(&self.account);
        self.registry
            .write(
                store.address,
                store.shape,
                StoreOp::put(target.as_str(), Value::from(status.as_str())),
            )
            .await?;
        info!(account = %self.account.short(), target = %target.short(), %status, "Trust edge set");
        Ok(())
    }

    /// Remove the edge to `target`
    pub async fn clear(&self, target: &AccountId) -> Result<()> {
        let store = trust_store(&self.account);
        self.registry
            .write(
                store.address,
                store.shape,
                StoreOp::Delete {
                    key: target.to_string(),
                },
            )
            .await?;
        debug!(account = %self.account.short(), target = %target.short(), "Trust edge cleared");
        Ok(())
    }

    /// Current edges
    pub async fn edges(&self) -> Result<Vec<TrustEdge>> {
        let store = trust_store(&self.account);
        let snapshot = self.registry.read(store.address, store.shape).await?;
        Ok(snapshot.map(|s| edges_from_snapshot(&s)).unwrap_or_default())
    }

    /// Live edges
    pub fn track(&self) -> Track<Vec<TrustEdge>> {
        track_trust_edges(&self.registry, &self.account)
    }
}

struct BlockListInner {
    storage: LocalStorage,
    tx: watch::Sender<BTreeSet<AccountId>>,
    /// Held for the whole of one change
    writer: Mutex<()>,
}

/// Accounts this device blocks without telling anyone
///
/// Persisted as a JSON array under [`PRIVATE_BLOCKS_KEY`].
#[derive(Clone)]
pub struct PrivateBlockList {
    inner: Arc<BlockListInner>,
}

impl PrivateBlockList {
    /// Load the list from local storage
    pub fn open(storage: LocalStorage) -> Result<Self> {
        let stored: Vec<String> = storage.get_json(PRIVATE_BLOCKS_KEY)?.unwrap_or_default();
        let accounts: BTreeSet<AccountId> = stored
            .iter()
            .filter_map(|s| AccountId::parse(s).ok())
            .collect();
        debug!(count = accounts.len(), "Loaded private block list");
        let (tx, _) = watch::channel(accounts);
        Ok(Self {
            inner: Arc::new(BlockListInner {
                storage,
                tx,
                writer: Mutex::new(()),
            }),
        })
    }

    fn update(&self, change: impl FnOnce(&mut BTreeSet<AccountId>) -> bool) -> Result<bool> {
        let _writer = self.inner.writer.lock();
        let mut next = self.inner.tx.borrow().clone();
        if !change(&mut next) {
            return Ok(false);
        }
        let stored: Vec<&str> = next.iter().map(AccountId::as_str).collect();
        self.inner.storage.put_json(PRIVATE_BLOCKS_KEY, &stored)?;
        self.inner.tx.send_replace(next);
        Ok(true)
    }

    /// Block `account`. Returns `false` if it was already blocked.
    pub fn block(&self, account: &AccountId) -> Result<bool> {
        let added = self.update(|set| set.insert(account.clone()))?;
        if added {
            info!(account = %account.short(), "Account privately blocked");
        }
        Ok(added)
    }

    /// Unblock `account`. Returns `false` if it was not blocked.
    pub fn unblock(&self, account: &AccountId) -> Result<bool> {
        self.update(|set| set.remove(account))
    }

    pub fn contains(&self, account: &AccountId) -> bool {
        self.inner.tx.borrow().contains(account)
    }

    /// Blocked accounts, sorted
    pub fn list(&self) -> Vec<AccountId> {
        self.inner.tx.borrow().iter().cloned().collect()
    }

    /// Live set of blocked accounts
    pub fn track(&self) -> Track<BTreeSet<AccountId>> {
        Track::from_watch(self.inner.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::identity::Keypair;
    use crate::store::MemoryBackend;
    use crate::track::test_support::{recorder, settle};

    fn account(seed: u8) -> AccountId {
        Keypair::from_seed(&[seed; 32]).account_id()
    }

    #[test]
    fn test_status_wire_text() {
        assert_eq!(serde_json::to_string(&TrustStatus::Blocked).unwrap(), "\"blocked\"");
        assert_eq!("trusted".parse::<TrustStatus>().unwrap(), TrustStatus::Trusted);
        assert!("maybe".parse::<TrustStatus>().is_err());
    }

    #[tokio::test]
    async fn test_last_write_wins_and_clear() {
        let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
        let store = TrustStore::new(registry, account(1));
        let target = account(2);

        store.set_trust(&target, TrustStatus::Trusted).await.unwrap();
        store.set_trust(&target, TrustStatus::Blocked).await.unwrap();
        assert_eq!(
            store.edges().await.unwrap(),
            vec![TrustEdge {
                target: target.clone(),
                status: TrustStatus::Blocked
            }]
        );

        store.clear(&target).await.unwrap();
        assert!(store.edges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_edge_rejected() {
        let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
        let store = TrustStore::new(registry, account(1));
        let result = store.set_trust(&account(1), TrustStatus::Trusted).await;
        assert!(matches!(result, Err(Error::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_garbage_entries_skipped() {
        let backend = MemoryBackend::new();
        let registry = StoreRegistry::new(Arc::new(backend.clone()));
        let owner = account(1);
        let store = trust_store(&owner);
        backend
            .write(store.address, store.shape, StoreOp::put("not-an-account", "trusted"))
            .unwrap();
        backend
            .write(store.address, store.shape, StoreOp::put(account(3).as_str(), "fond"))
            .unwrap();
        backend
            .write(store.address, store.shape, StoreOp::put(account(4).as_str(), "trusted"))
            .unwrap();

        let edges = TrustStore::new(registry, owner).edges().await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, account(4));
    }

    #[test]
    fn test_concurrent_blocks_are_all_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.redb");
        let blocks = PrivateBlockList::open(LocalStorage::new(&path).unwrap()).unwrap();

        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let blocks = blocks.clone();
                std::thread::spawn(move || {
                    for i in 0..8u8 {
                        blocks.block(&account(10 + t * 8 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(blocks.list().len(), 64);

        drop(blocks);
        let reopened = PrivateBlockList::open(LocalStorage::new(&path).unwrap()).unwrap();
        assert_eq!(reopened.list().len(), 64);
    }

    #[tokio::test]
    async fn test_private_blocks_persist_and_track() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.redb");
        {
            let blocks = PrivateBlockList::open(LocalStorage::new(&path).unwrap()).unwrap();
            let (seen, deliver) = recorder();
            let _sub = blocks.track().subscribe(deliver);
            settle().await;

            assert!(blocks.block(&account(5)).unwrap());
            assert!(!blocks.block(&account(5)).unwrap());
            settle().await;
            let seen = seen.lock();
            assert!(seen.first().unwrap().is_empty());
            assert!(seen.last().unwrap().contains(&account(5)));
        }

        let storage = LocalStorage::new(&path).unwrap();
        let blocks = PrivateBlockList::open(storage.clone()).unwrap();
        assert!(blocks.contains(&account(5)));
        let raw: Vec<String> = storage.get_json(PRIVATE_BLOCKS_KEY).unwrap().unwrap();
        assert_eq!(raw, vec![account(5).to_string()]);

        assert!(blocks.unblock(&account(5)).unwrap());
        assert!(blocks.list().is_empty());
    }
}
