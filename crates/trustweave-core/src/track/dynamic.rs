//! One downstream tracker per element of a changing list

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{DependencyTable, Subscription, Track};
use crate::error::{Error, Result};
use crate::store::{Address, StoreRef};

/// Key under which a branch's downstream tracker is shared
pub type DedupCode = String;

/// An element produced by the root of a dynamic set
pub trait DynamicBranch: Clone + Send + Sync + 'static {
    /// Code identifying the branch, if the branch can derive one itself
    fn dedup_code(&self) -> Option<DedupCode> {
        None
    }
}

impl DynamicBranch for StoreRef {
    fn dedup_code(&self) -> Option<DedupCode> {
        Some(self.address.to_base58())
    }
}

impl DynamicBranch for Address {
    fn dedup_code(&self) -> Option<DedupCode> {
        Some(self.to_base58())
    }
}

impl DynamicBranch for String {
    fn dedup_code(&self) -> Option<DedupCode> {
        Some(self.clone())
    }
}

/// Options for [`track_dynamic_set`]
pub struct DynamicSetOptions<B> {
    /// Overrides [`DynamicBranch::dedup_code`]
    pub code: Option<Arc<dyn Fn(&B) -> DedupCode + Send + Sync>>,
}

impl<B> Default for DynamicSetOptions<B> {
    fn default() -> Self {
        Self { code: None }
    }
}

impl<B> Clone for DynamicSetOptions<B> {
    fn clone(&self) -> Self {
        Self {
            code: self.code.clone(),
        }
    }
}

impl<B> DynamicSetOptions<B> {
    /// Use `code` to key branches
    pub fn with_code(code: impl Fn(&B) -> DedupCode + Send + Sync + 'static) -> Self {
        Self {
            code: Some(Arc::new(code)),
        }
    }
}

/// Default reduction: concatenate every element's list in root order
pub fn flatten<B, T: IntoIterator>(values: Vec<(B, T)>) -> Vec<T::Item> {
    values.into_iter().flat_map(|(_, v)| v).collect()
}

struct Node<B, T> {
    id: u64,
    branch: B,
    value: Option<T>,
    _subscription: Subscription,
}

enum Event<B, T> {
    Root(Vec<B>),
    Branch(u64, T),
}

/// Track a changing list, one downstream tracker per distinct element
///
/// Branches are keyed by their dedup code. A branch whose code is already
/// tracked reuses that tracker; a tracker is released once no element of the
/// current list carries its code. After each change the current values are
/// passed to `reduce` in root order (elements that have not delivered yet are
/// left out) and the result is delivered once.
///
/// A list of more than one branch without a way to derive codes fails the
/// subscription with [`Error::MissingDedupCode`]; see
/// [`Subscription::failure`].
pub fn track_dynamic_set<B, T, R>(
    root: Track<Vec<B>>,
    options: DynamicSetOptions<B>,
    branch: impl Fn(&B) -> Track<T> + Send + Sync + 'static,
    reduce: impl Fn(Vec<(B, T)>) -> R + Send + 'static,
    deliver: impl FnMut(R) + Send + 'static,
) -> Subscription
where
    B: DynamicBranch,
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    Subscription::spawn(Box::new(deliver), move |mut sink| async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event<B, T>>();
        let root_tx = tx.clone();
        let _root = root.subscribe(move |list| {
            let _ = root_tx.send(Event::Root(list));
        });

        let mut nodes: DependencyTable<DedupCode, Node<B, T>> = DependencyTable::new();
        let mut by_id: HashMap<u64, DedupCode> = HashMap::new();
        let mut order: Vec<DedupCode> = Vec::new();
        let mut next_id = 0u64;
        let mut have_root = false;

        while let Some(first) = rx.recv().await {
            let mut pending = Some(first);
            let mut changed = false;

            while let Some(event) = pending.take().or_else(|| rx.try_recv().ok()) {
                match event {
                    Event::Root(list) => {
                        let (codes, anonymous) = codes_for(&list, &options)?;
                        if anonymous {
                            // No code to compare against, so the branch is always restarted
                            for code in order.drain(..) {
                                if let Some(node) = nodes.remove(&code) {
                                    by_id.remove(&node.id);
                                }
                            }
                        }

                        for (item, code) in list.iter().zip(&codes) {
                            let created = nodes.acquire(code.clone(), || {
                                next_id += 1;
                                let id = next_id;
                                let tx = tx.clone();
                                let subscription = branch(item).subscribe(move |value| {
                                    let _ = tx.send(Event::Branch(id, value));
                                });
                                Node {
                                    id,
                                    branch: item.clone(),
                                    value: None,
                                    _subscription: subscription,
                                }
                            });
                            if created {
                                if let Some(node) = nodes.get(code) {
                                    by_id.insert(node.id, code.clone());
                                }
                                trace!(%code, "Branch added");
                            } else if let Some(node) = nodes.get_mut(code) {
                                node.branch = item.clone();
                            }
                        }
                        for code in order.drain(..) {
                            if let Some(node) = nodes.release(&code) {
                                by_id.remove(&node.id);
                                trace!(%code, "Branch released");
                            }
                        }

                        order = codes;
                        have_root = true;
                        changed = true;
                    }
                    Event::Branch(id, value) => {
                        let Some(code) = by_id.get(&id) else {
                            continue;
                        };
                        if let Some(node) = nodes.get_mut(code) {
                            node.value = Some(value);
                            changed = true;
                        }
                    }
                }
            }

            if !(have_root && changed) {
                continue;
            }
            let values: Vec<(B, T)> = order
                .iter()
                .filter_map(|code| {
                    let node = nodes.get(code)?;
                    Some((node.branch.clone(), node.value.clone()?))
                })
                .collect();
            debug!(branches = order.len(), ready = values.len(), "Dynamic set updated");
            if !sink.send(reduce(values)) {
                break;
            }
        }
        Ok(())
    })
}

fn codes_for<B: DynamicBranch>(
    list: &[B],
    options: &DynamicSetOptions<B>,
) -> Result<(Vec<DedupCode>, bool)> {
    if let Some(code) = &options.code {
        return Ok((list.iter().map(|b| code(b)).collect(), false));
    }

    let mut codes = Vec::with_capacity(list.len());
    for item in list {
        match item.dedup_code() {
            Some(code) => codes.push(code),
            None if list.len() == 1 => return Ok((vec![DedupCode::new()], true)),
            None => {
                return Err(Error::MissingDedupCode {
                    branches: list.len(),
                })
            }
        }
    }
    Ok((codes, false))
}

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::*;
    use crate::store::{MemoryBackend, Snapshot, StoreOp, StoreRegistry};
    use crate::track::test_support::{recorder, settle};

    #[derive(Clone, Debug, PartialEq)]
    struct Anonymous(u32);

    impl DynamicBranch for Anonymous {}

    fn names(snapshots: Vec<(StoreRef, Option<Arc<Snapshot>>)>) -> Vec<String> {
        snapshots
            .into_iter()
            .filter_map(|(_, s)| s?.data.get("name")?.as_text().map(str::to_string))
            .collect()
    }

    fn setup(names: &[&str]) -> (MemoryBackend, StoreRegistry, Vec<StoreRef>) {
        let backend = MemoryBackend::new();
        let registry = StoreRegistry::new(Arc::new(backend.clone()));
        let refs = names
            .iter()
            .map(|n| {
                let store = StoreRef::key_value(Address::from_content(n.as_bytes()));
                backend
                    .write(store.address, store.shape, StoreOp::put("name", *n))
                    .unwrap();
                store
            })
            .collect();
        (backend, registry, refs)
    }

    #[tokio::test]
    async fn test_tracks_added_and_removed_elements() {
        let (_backend, registry, refs) = setup(&["a", "b", "c"]);
        let (tx, rx) = watch::channel(vec![refs[0], refs[1]]);
        let (seen, deliver) = recorder();
        let reg = registry.clone();
        let _sub = track_dynamic_set(
            Track::from_watch(rx),
            DynamicSetOptions::default(),
            move |r: &StoreRef| Track::store(&reg, *r),
            names,
            deliver,
        );
        settle().await;
        assert_eq!(seen.lock().last().unwrap(), &vec!["a", "b"]);

        tx.send(vec![refs[2], refs[0]]).unwrap();
        settle().await;
        assert_eq!(seen.lock().last().unwrap(), &vec!["c", "a"]);
        assert!(!registry.is_open(&refs[1].address));
        assert!(registry.is_open(&refs[0].address));
    }

    #[tokio::test]
    async fn test_duplicate_codes_share_one_tracker() {
        let (backend, registry, refs) = setup(&["a"]);
        let (tx, rx) = watch::channel(vec![refs[0], refs[0]]);
        let (seen, deliver) = recorder();
        let reg = registry.clone();
        let _sub = track_dynamic_set(
            Track::from_watch(rx),
            DynamicSetOptions::default(),
            move |r: &StoreRef| Track::store(&reg, *r),
            names,
            deliver,
        );
        settle().await;
        assert_eq!(seen.lock().last().unwrap(), &vec!["a", "a"]);
        assert_eq!(registry.lease_count(&refs[0].address), 1);
        assert_eq!(backend.open_calls(&refs[0].address), 1);

        // Dropping one occurrence keeps the shared tracker alive
        tx.send(vec![refs[0]]).unwrap();
        settle().await;
        assert_eq!(seen.lock().last().unwrap(), &vec!["a"]);
        assert_eq!(backend.open_calls(&refs[0].address), 1);
    }

    #[tokio::test]
    async fn test_missing_code_with_many_branches_fails() {
        let (_tx, rx) = watch::channel(vec![Anonymous(1), Anonymous(2)]);
        let (seen, deliver) = recorder::<Vec<u32>>();
        let sub = track_dynamic_set(
            Track::from_watch(rx),
            DynamicSetOptions::default(),
            |a: &Anonymous| Track::constant(vec![a.0]),
            flatten,
            deliver,
        );
        settle().await;
        assert!(seen.lock().is_empty());
        assert!(matches!(
            sub.failure().as_deref(),
            Some(Error::MissingDedupCode { branches: 2 })
        ));
    }

    #[tokio::test]
    async fn test_single_branch_without_code_is_allowed() {
        let (_tx, rx) = watch::channel(vec![Anonymous(4)]);
        let (seen, deliver) = recorder();
        let sub = track_dynamic_set(
            Track::from_watch(rx),
            DynamicSetOptions::default(),
            |a: &Anonymous| Track::constant(vec![a.0]),
            flatten,
            deliver,
        );
        settle().await;
        assert_eq!(seen.lock().last().unwrap(), &vec![4]);
        assert!(sub.failure().is_none());
    }

    #[tokio::test]
    async fn test_code_override() {
        let (_tx, rx) = watch::channel(vec![Anonymous(1), Anonymous(2), Anonymous(1)]);
        let (seen, deliver) = recorder();
        let sub = track_dynamic_set(
            Track::from_watch(rx),
            DynamicSetOptions::with_code(|a: &Anonymous| a.0.to_string()),
            |a: &Anonymous| Track::constant(vec![a.0 * 10]),
            flatten,
            deliver,
        );
        settle().await;
        assert_eq!(seen.lock().last().unwrap(), &vec![10, 20, 10]);
        assert!(sub.failure().is_none());
    }

    #[tokio::test]
    async fn test_release_stops_all_branches() {
        let (backend, registry, refs) = setup(&["a", "b"]);
        let (_tx, rx) = watch::channel(refs.clone());
        let (seen, deliver) = recorder();
        let reg = registry.clone();
        let sub = track_dynamic_set(
            Track::from_watch(rx),
            DynamicSetOptions::default(),
            move |r: &StoreRef| Track::store(&reg, *r),
            names,
            deliver,
        );
        settle().await;
        sub.unsubscribe();
        let before = seen.lock().len();

        backend
            .write(refs[0].address, refs[0].shape, StoreOp::put("name", "z"))
            .unwrap();
        settle().await;
        assert_eq!(seen.lock().len(), before);
        assert_eq!(registry.open_count(), 0);
    }
}
