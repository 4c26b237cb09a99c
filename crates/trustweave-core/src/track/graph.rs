//! Live closure of stores reachable through references

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{track_store, Subscription};
use crate::store::{Address, Fingerprint, Snapshot, StoreRef, StoreRegistry};

/// One store of a [`ReachableSet`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReachableStore {
    /// Reference the store was discovered through
    pub store: StoreRef,
    /// Hops from the root along the shortest path
    pub depth: usize,
    /// Latest known content, `None` while the store is not reachable yet
    pub snapshot: Option<Arc<Snapshot>>,
}

/// Every store reachable from a root, keyed by address
#[derive(Debug, Clone, PartialEq)]
pub struct ReachableSet {
    /// Where discovery started
    pub root: StoreRef,
    /// Reachable stores, including the root
    pub stores: BTreeMap<Address, ReachableStore>,
}

impl ReachableSet {
    /// Addresses of all reachable stores, sorted
    pub fn addresses(&self) -> Vec<Address> {
        self.stores.keys().copied().collect()
    }

    /// Whether `address` is currently reachable
    pub fn contains(&self, address: &Address) -> bool {
        self.stores.contains_key(address)
    }

    /// Combined fingerprint of every reachable store
    ///
    /// Changes iff a store joins or leaves the set or any store's heads
    /// change. Stores not reachable yet contribute a fixed marker.
    pub fn fingerprint(&self) -> Fingerprint {
        let chunks: Vec<Vec<u8>> = self
            .stores
            .iter()
            .map(|(address, entry)| {
                let mut chunk = address.as_bytes().to_vec();
                match &entry.snapshot {
                    Some(snapshot) => chunk.extend_from_slice(&snapshot.heads.0),
                    None => chunk.push(0),
                }
                chunk
            })
            .collect();
        Fingerprint::of(chunks.iter().map(Vec::as_slice))
    }
}

struct GraphNode {
    id: u64,
    store: StoreRef,
    snapshot: Option<Arc<Snapshot>>,
    _subscription: Subscription,
}

/// Track every store reachable from `root`
///
/// Discovery is breadth-first over the [`Value::Ref`]s found in each store's
/// content. A store is tracked at most once however many paths lead to it,
/// so cycles are harmless. After every change the reachable set is swept
/// again from the root and stores no longer reachable are released.
///
/// When two references disagree on the shape of one address, the shape seen
/// first wins and the conflict is logged.
///
/// [`Value::Ref`]: crate::store::Value::Ref
pub fn track_recursive_graph(
    registry: &StoreRegistry,
    root: StoreRef,
    deliver: impl FnMut(ReachableSet) + Send + 'static,
) -> Subscription {
    let registry = registry.clone();
    Subscription::spawn(Box::new(deliver), move |mut sink| async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u64, Option<Arc<Snapshot>>)>();
        let mut nodes: HashMap<Address, GraphNode> = HashMap::new();
        let mut next_id = 0u64;
        let mut last: Option<ReachableSet> = None;

        let start = |store: StoreRef, next_id: &mut u64| {
            *next_id += 1;
            let id = *next_id;
            let tx = tx.clone();
            let subscription = track_store(&registry, store, move |snapshot| {
                let _ = tx.send((id, snapshot));
            });
            GraphNode {
                id,
                store,
                snapshot: None,
                _subscription: subscription,
            }
        };

        nodes.insert(root.address, start(root, &mut next_id));
        debug!(%root, "Tracking recursive graph");

        while let Some(first) = rx.recv().await {
            let mut pending = Some(first);
            while let Some((id, snapshot)) = pending.take().or_else(|| rx.try_recv().ok()) {
                if let Some(node) = nodes.values_mut().find(|n| n.id == id) {
                    node.snapshot = snapshot;
                }
            }

            // Sweep: walk from the root over known content
            let mut reachable: BTreeMap<Address, (StoreRef, usize)> = BTreeMap::new();
            let mut queue = VecDeque::from([(root, 0usize)]);
            reachable.insert(root.address, (root, 0));
            while let Some((store, depth)) = queue.pop_front() {
                let Some(snapshot) = nodes.get(&store.address).and_then(|n| n.snapshot.clone())
                else {
                    continue;
                };
                for child in snapshot.data.references() {
                    if let Some((seen, _)) = reachable.get(&child.address) {
                        if seen.shape != child.shape {
                            warn!(address = %child.address, first = %seen.shape, other = %child.shape, "Conflicting shapes for one address");
                        }
                        continue;
                    }
                    reachable.insert(child.address, (child, depth + 1));
                    queue.push_back((child, depth + 1));
                }
            }

            nodes.retain(|address, node| {
                let keep = reachable.contains_key(address);
                if !keep {
                    trace!(store = %node.store, "Store no longer reachable");
                }
                keep
            });
            let mut discovered = false;
            for (address, (store, _)) in &reachable {
                if !nodes.contains_key(address) {
                    trace!(%store, "Store discovered");
                    nodes.insert(*address, start(*store, &mut next_id));
                    discovered = true;
                }
            }
            if discovered {
                // New stores report their first state before the set is delivered
                continue;
            }

            let set = ReachableSet {
                root,
                stores: reachable
                    .into_iter()
                    .map(|(address, (store, depth))| {
                        let snapshot = nodes.get(&address).and_then(|n| n.snapshot.clone());
                        (address, ReachableStore { store, depth, snapshot })
                    })
                    .collect(),
            };
            if last.as_ref() == Some(&set) {
                continue;
            }
            last = Some(set.clone());
            if !sink.send(set) {
                break;
            }
        }
        Ok(())
    })
}

/// Track a fingerprint of everything reachable from `root`
///
/// Delivers only when the fingerprint changes, i.e. when any store in the
/// reachable set changes or the set itself changes.
pub fn track_recursive_fingerprint(
    registry: &StoreRegistry,
    root: StoreRef,
    mut deliver: impl FnMut(Fingerprint) + Send + 'static,
) -> Subscription {
    let mut last: Option<Fingerprint> = None;
    track_recursive_graph(registry, root, move |set| {
        let fingerprint = set.fingerprint();
        if last != Some(fingerprint) {
            last = Some(fingerprint);
            deliver(fingerprint);
        }
    })
}
