//! Depth-bounded transitive trust propagation
//!
//! Expands the relation graph breadth-first from an origin account and folds
//! every relation pointing at an account into one membership record.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  propagator task (one per track_network call)                   │
//! │  ├── control channel   <- change_depth(n)                      │
//! │  ├── relation trackers  one per account at depth <= ceiling    │
//! │  │                      ref-counted by requesting accounts     │
//! │  └── on every update:                                          │
//! │       1. BFS from the origin over positive relations           │
//! │       2. acquire newly requested trackers, release stale ones  │
//! │       3. fold relation records into memberships                │
//! │       4. deliver the view if it changed                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Attenuation per hop uses the exponent `depth - 1`, so a relation from a
//! depth-0 account (depth-1 record) is taken at face value:
//!
//! ```text
//!   positive = 1 - Π(1 - c · 0.8^(d-1))        c > 0
//!   cost     = 1 - Π(1 - |c| · 0.9^(d-1))      c < 0
//!   confidence = clamp(positive - cost, -1, 1)
//! ```
//!
//! A block from the origin itself forces the membership to exactly -1.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::identity::AccountId;
use crate::relations::{track_relations, Relation, TrustContext};
use crate::track::{DependencyTable, Subscription, Track};

/// Per-hop attenuation of positive relations
pub const TRUST_ATTENUATION: f64 = 0.8;
/// Per-hop attenuation of blocks
pub const BLOCK_ATTENUATION: f64 = 0.9;

/// A relation discovered during propagation
#[derive(Debug, Clone, PartialEq)]
pub struct RelationRecord {
    pub from: AccountId,
    pub to: AccountId,
    /// In `[-1, 1]`
    pub confidence: f64,
    /// Hops from the origin to `to` along this relation
    pub depth: usize,
}

/// Derived position of one account in the network
#[derive(Debug, Clone, PartialEq)]
pub struct Membership {
    pub account: AccountId,
    /// In `[-1, 1]`
    pub confidence: f64,
    /// Minimum depth across every path reaching the account
    pub depth: usize,
}

/// Snapshot of a propagated network
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkView {
    pub origin: AccountId,
    /// Depth ceiling the view was computed with
    pub depth: usize,
    /// Sorted by depth, then account
    pub members: Vec<Membership>,
    /// Sorted by source, then target
    pub relations: Vec<RelationRecord>,
}

impl NetworkView {
    /// Membership of `account`, if reachable
    pub fn member(&self, account: &AccountId) -> Option<&Membership> {
        self.members.iter().find(|m| m.account == *account)
    }

    /// Members that are not blocked (confidence >= 0)
    pub fn trusted_members(&self) -> impl Iterator<Item = &Membership> {
        self.members.iter().filter(|m| m.confidence >= 0.0)
    }
}

/// Fold the relations pointing at one account into a confidence
///
/// `records` holds `(confidence, depth)` pairs. `direct_block` is set when
/// the origin itself blocks the account.
pub fn membership_confidence(records: &[(f64, usize)], direct_block: bool) -> f64 {
    if direct_block {
        return -1.0;
    }
    let mut keep_positive = 1.0;
    let mut keep_negative = 1.0;
    for &(confidence, depth) in records {
        let hops = depth.saturating_sub(1) as i32;
        if confidence > 0.0 {
            keep_positive *= 1.0 - (confidence.min(1.0) * TRUST_ATTENUATION.powi(hops));
        } else if confidence < 0.0 {
            keep_negative *= 1.0 - (confidence.abs().min(1.0) * BLOCK_ATTENUATION.powi(hops));
        }
    }
    let positive = 1.0 - keep_positive;
    let cost = 1.0 - keep_negative;
    (positive - cost).clamp(-1.0, 1.0)
}

/// Build the view from the known relations of every tracked account
///
/// Returns the view and the `(requester, account)` pairs that need tracking.
fn propagate(
    origin: &AccountId,
    ceiling: usize,
    known: &HashMap<AccountId, Vec<Relation>>,
) -> (NetworkView, BTreeSet<(AccountId, AccountId)>) {
    let blocked_by_origin: BTreeSet<&AccountId> = known
        .get(origin)
        .map(|rels| rels.iter().filter(|r| r.confidence < 0.0).map(|r| &r.account).collect())
        .unwrap_or_default();

    let mut depths: BTreeMap<AccountId, usize> = BTreeMap::new();
    let mut requests: BTreeSet<(AccountId, AccountId)> = BTreeSet::new();
    let mut records: BTreeMap<(AccountId, AccountId), RelationRecord> = BTreeMap::new();
    let mut queue = VecDeque::from([(origin.clone(), 0usize)]);
    depths.insert(origin.clone(), 0);
    requests.insert((origin.clone(), origin.clone()));

    while let Some((account, depth)) = queue.pop_front() {
        if depth >= ceiling {
            continue;
        }
        let Some(relations) = known.get(&account) else {
            continue;
        };
        for relation in relations {
            if relation.account == account {
                continue;
            }
            records.insert(
                (account.clone(), relation.account.clone()),
                RelationRecord {
                    from: account.clone(),
                    to: relation.account.clone(),
                    confidence: relation.confidence,
                    depth: depth + 1,
                },
            );

            let expandable = relation.confidence > 0.0
                && relation.account != *origin
                && !blocked_by_origin.contains(&relation.account);
            if !expandable {
                continue;
            }
            requests.insert((account.clone(), relation.account.clone()));
            if !depths.contains_key(&relation.account) {
                depths.insert(relation.account.clone(), depth + 1);
                queue.push_back((relation.account.clone(), depth + 1));
            }
        }
    }

    let mut incoming: BTreeMap<&AccountId, Vec<&RelationRecord>> = BTreeMap::new();
    for record in records.values() {
        if record.to != *origin {
            incoming.entry(&record.to).or_default().push(record);
        }
    }

    let mut members = vec![Membership {
        account: origin.clone(),
        confidence: 1.0,
        depth: 0,
    }];
    for (account, pointing) in incoming {
        let direct_block = pointing
            .iter()
            .any(|r| r.from == *origin && r.confidence < 0.0);
        let pairs: Vec<(f64, usize)> = pointing.iter().map(|r| (r.confidence, r.depth)).collect();
        let depth = pointing.iter().map(|r| r.depth).min().unwrap_or(0);
        members.push(Membership {
            account: account.clone(),
            confidence: membership_confidence(&pairs, direct_block),
            depth,
        });
    }
    members.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.account.cmp(&b.account)));

    let view = NetworkView {
        origin: origin.clone(),
        depth: ceiling,
        members,
        relations: records.into_values().collect(),
    };
    (view, requests)
}

struct TrackedAccount {
    id: u64,
    _subscription: Subscription,
}

enum Event {
    Relations(u64, Vec<Relation>),
    Depth(usize),
}

/// Live handle to a propagated network
#[must_use = "dropping a NetworkHandle releases the whole network"]
pub struct NetworkHandle {
    control: mpsc::UnboundedSender<usize>,
    depth: Arc<AtomicUsize>,
    tracked: Arc<Mutex<BTreeSet<AccountId>>>,
    views: watch::Receiver<Option<NetworkView>>,
    subscription: Subscription,
}

impl NetworkHandle {
    /// Change the depth ceiling without re-subscribing
    ///
    /// Increasing it resumes discovery from the current frontier; decreasing
    /// it releases every account beyond the new ceiling. Setting the current
    /// value again does nothing.
    pub fn change_depth(&self, depth: usize) {
        if self.depth.swap(depth, Ordering::SeqCst) != depth {
            let _ = self.control.send(depth);
        }
    }

    /// Current depth ceiling
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Accounts whose relations are currently tracked
    pub fn tracked_accounts(&self) -> BTreeSet<AccountId> {
        self.tracked.lock().clone()
    }

    /// Latest view, `None` until the origin's relations are known
    pub fn view(&self) -> Option<NetworkView> {
        self.views.borrow().clone()
    }

    /// Follow the view as a track, for composition with other trackers
    pub fn track_view(&self) -> Track<Option<NetworkView>> {
        Track::from_watch(self.views.clone())
    }

    /// Whether the propagator is still running
    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Release the network and every relation tracker it holds
    pub fn unsubscribe(self) {
        self.subscription.unsubscribe();
    }
}

/// Propagate trust from `origin` out to `max_depth` hops
pub fn track_network(
    ctx: &TrustContext,
    origin: &AccountId,
    max_depth: usize,
    deliver: impl FnMut(NetworkView) + Send + 'static,
) -> NetworkHandle {
    let (control, mut control_rx) = mpsc::unbounded_channel::<usize>();
    let depth = Arc::new(AtomicUsize::new(max_depth));
    let tracked = Arc::new(Mutex::new(BTreeSet::new()));
    let ctx = ctx.clone();
    let origin = origin.clone();
    let tracked_out = tracked.clone();
    let (views_tx, views) = watch::channel(None);

    let subscription = Subscription::spawn(Box::new(deliver), move |mut sink| async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let mut ceiling = max_depth;
        let mut trackers: DependencyTable<AccountId, TrackedAccount> = DependencyTable::new();
        let mut ids: HashMap<u64, AccountId> = HashMap::new();
        let mut known: HashMap<AccountId, Vec<Relation>> = HashMap::new();
        let mut requested: BTreeSet<(AccountId, AccountId)> = BTreeSet::new();
        let mut next_id = 0u64;
        let mut last: Option<NetworkView> = None;

        info!(origin = %origin.short(), depth = ceiling, "Tracking network");

        let start = |account: &AccountId, next_id: &mut u64| {
            *next_id += 1;
            let id = *next_id;
            let tx = tx.clone();
            let subscription = track_relations(&ctx, account).subscribe(move |relations| {
                let _ = tx.send(Event::Relations(id, relations));
            });
            TrackedAccount {
                id,
                _subscription: subscription,
            }
        };

        // The origin requests itself
        let pair = (origin.clone(), origin.clone());
        trackers.acquire(origin.clone(), || start(&origin, &mut next_id));
        if let Some(node) = trackers.get(&origin) {
            ids.insert(node.id, origin.clone());
        }
        requested.insert(pair);

        loop {
            let first = tokio::select! {
                Some(event) = rx.recv() => event,
                Some(depth) = control_rx.recv() => Event::Depth(depth),
                else => break,
            };

            let mut pending = Some(first);
            let mut changed = false;
            while let Some(event) = pending
                .take()
                .or_else(|| control_rx.try_recv().ok().map(Event::Depth))
                .or_else(|| rx.try_recv().ok())
            {
                match event {
                    Event::Relations(id, relations) => {
                        let Some(account) = ids.get(&id) else {
                            continue;
                        };
                        trace!(account = %account.short(), count = relations.len(), "Relations changed");
                        known.insert(account.clone(), relations);
                        changed = true;
                    }
                    Event::Depth(depth) => {
                        if depth != ceiling {
                            debug!(from = ceiling, to = depth, "Depth ceiling changed");
                            ceiling = depth;
                            changed = true;
                        }
                    }
                }
            }
            if !changed || !known.contains_key(&origin) {
                continue;
            }

            let (view, requests) = propagate(&origin, ceiling, &known);

            for pair in requests.difference(&requested) {
                let account = &pair.1;
                let created = trackers.acquire(account.clone(), || start(account, &mut next_id));
                if created {
                    if let Some(node) = trackers.get(account) {
                        ids.insert(node.id, account.clone());
                    }
                    debug!(account = %account.short(), "Tracking account");
                }
            }
            for pair in requested.difference(&requests) {
                let account = &pair.1;
                if let Some(node) = trackers.release(account) {
                    ids.remove(&node.id);
                    known.remove(account);
                    debug!(account = %account.short(), "Account released");
                }
            }
            requested = requests;
            *tracked_out.lock() = trackers.keys().cloned().collect();

            if last.as_ref() == Some(&view) {
                continue;
            }
            last = Some(view.clone());
            views_tx.send_replace(Some(view.clone()));
            if !sink.send(view) {
                break;
            }
        }
        Ok(())
    });

    NetworkHandle {
        control,
        depth,
        tracked,
        views,
        subscription,
    }
}
