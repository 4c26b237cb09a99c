//! Ranked search over the trust network
//!
//! Lists items from every non-blocked network member, scores each item and
//! keeps the best `count` of them live. A debounce timer nudges the network
//! depth so that the candidate pool stays near the requested size.
//!
//! ```text
//!   network view ──> members (confidence >= 0)
//!                      └─ one listing tracker per member  (ItemLister)
//!                           └─ one scoring tracker per item (QualityScorer)
//!                                └─ score, rank, deliver top-N
//!   every change restarts the debounce; on expiry:
//!     pool < N   -> depth + 1 (up to max_depth)
//!     pool > 2N  -> depth - 1 (down to min_depth)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::identity::AccountId;
use crate::network::{NetworkHandle, NetworkView};
use crate::store::{Address, Snapshot, StoreOp, StoreRef, StoreRegistry, Value};
use crate::track::{track_dynamic_set, DynamicSetOptions, Subscription, Track};

/// Default time without changes before the depth is rebalanced
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(3);

/// Per-item scores from a [`QualityScorer`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemQuality {
    /// Relevance to the query
    pub objective: f64,
    /// Intrinsic quality
    pub quality: f64,
}

/// Everything a score is computed from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    /// Membership confidence of the listing account
    pub confidence: f64,
    pub quality: f64,
    pub objective: f64,
}

/// Custom score function
pub type ScoreCombiner = Arc<dyn Fn(&ScoreInputs) -> f64 + Send + Sync>;

/// Items published by an account
pub type ItemLister = Arc<dyn Fn(&AccountId) -> Track<Vec<StoreRef>> + Send + Sync>;

/// Live scores of one item
pub type QualityScorer = Arc<dyn Fn(&StoreRef) -> Track<ItemQuality> + Send + Sync>;

/// Collection of item references an account publishes for search
pub fn published_store(account: &AccountId) -> StoreRef {
    StoreRef::collection(Address::derive("published", account))
}

/// Append `item` to `account`'s published collection
pub async fn publish_item(registry: &StoreRegistry, account: &AccountId, item: StoreRef) -> Result<()> {
    let store = published_store(account);
    registry
        .write(store.address, store.shape, StoreOp::append(item))
        .await?;
    debug!(account = %account.short(), item = %item.address, "Item published");
    Ok(())
}

/// Lister over every account's [`published_store`]
pub fn published_items(registry: &StoreRegistry) -> ItemLister {
    let registry = registry.clone();
    Arc::new(move |account: &AccountId| {
        Track::store(&registry, published_store(account)).map(|snapshot: Option<Arc<Snapshot>>| {
            snapshot.map(|s| s.data.references()).unwrap_or_default()
        })
    })
}

/// Scorer reading the numeric `quality` and `objective` keys of each item
///
/// Missing keys count as 0.
pub fn stored_quality(registry: &StoreRegistry) -> QualityScorer {
    let registry = registry.clone();
    Arc::new(move |item: &StoreRef| {
        Track::store(&registry, *item).map(|snapshot: Option<Arc<Snapshot>>| {
            let number = |key: &str| {
                snapshot
                    .as_ref()
                    .and_then(|s| s.data.get(key))
                    .and_then(Value::as_number)
                    .unwrap_or(0.0)
            };
            ItemQuality {
                objective: number("objective"),
                quality: number("quality"),
            }
        })
    })
}

/// Mean of confidence, quality and objective
pub fn default_score(inputs: &ScoreInputs) -> f64 {
    (inputs.confidence + inputs.quality + inputs.objective) / 3.0
}

#[derive(Clone)]
pub struct SearchOptions {
    /// Number of results wanted
    pub count: usize,
    pub debounce: Duration,
    pub min_depth: usize,
    pub max_depth: usize,
    /// Replaces [`default_score`]
    pub combiner: Option<ScoreCombiner>,
}

impl SearchOptions {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }
}

/// Defaults with the configured debounce, widening at least to the
/// configured network depth
impl From<&NodeConfig> for SearchOptions {
    fn from(config: &NodeConfig) -> Self {
        let defaults = Self::default();
        Self {
            debounce: config.search_debounce(),
            max_depth: defaults.max_depth.max(config.default_depth),
            ..defaults
        }
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            count: 10,
            debounce: DEFAULT_DEBOUNCE,
            min_depth: 1,
            max_depth: 4,
            combiner: None,
        }
    }
}

/// One delivered result
#[derive(Debug, Clone, PartialEq)]
pub struct RankedItem {
    pub item: StoreRef,
    /// Account whose listing contributed the best score
    pub account: AccountId,
    pub score: f64,
    /// 1 for the best result
    pub rank: usize,
}

enum Event {
    View(Option<NetworkView>),
    Listings(Vec<(AccountId, Vec<StoreRef>)>),
    Scores(Vec<(StoreRef, ItemQuality)>),
    Count(usize),
}

/// Live handle to a search
#[must_use = "dropping a SearchHandle stops the search"]
pub struct SearchHandle {
    control: mpsc::UnboundedSender<usize>,
    count: Arc<AtomicUsize>,
    network: Arc<NetworkHandle>,
    subscription: Subscription,
}

impl SearchHandle {
    /// Change the number of results; re-evaluates immediately
    pub fn set_count(&self, count: usize) {
        self.count.store(count, Ordering::SeqCst);
        let _ = self.control.send(count);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Current depth of the underlying network
    pub fn depth(&self) -> usize {
        self.network.depth()
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Stop the search and release every tracker it holds
    pub fn unsubscribe(self) {
        self.subscription.unsubscribe();
    }
}

struct Ranking {
    confidence: HashMap<AccountId, f64>,
    listings: Vec<(AccountId, Vec<StoreRef>)>,
    qualities: HashMap<Address, ItemQuality>,
    discovered: HashMap<Address, u64>,
    next_discovery: u64,
}

impl Ranking {
    /// Items in discovery order, each listed once
    fn items(&mut self) -> Vec<StoreRef> {
        let mut items: Vec<StoreRef> = Vec::new();
        for (_, listed) in &self.listings {
            for item in listed {
                if !self.discovered.contains_key(&item.address) {
                    self.discovered.insert(item.address, self.next_discovery);
                    self.next_discovery += 1;
                }
                if !items.iter().any(|i| i.address == item.address) {
                    items.push(*item);
                }
            }
        }
        // Items no longer listed by anyone are forgotten
        self.discovered
            .retain(|address, _| items.iter().any(|i| i.address == *address));
        items.sort_by_key(|i| self.discovered.get(&i.address).copied().unwrap_or(u64::MAX));
        items
    }

    /// Every scorable candidate, best first
    fn candidates(&self, combine: &dyn Fn(&ScoreInputs) -> f64) -> Vec<RankedItem> {
        let mut best: HashMap<Address, RankedItem> = HashMap::new();
        for (account, listed) in &self.listings {
            let Some(&confidence) = self.confidence.get(account) else {
                continue;
            };
            for item in listed {
                let Some(quality) = self.qualities.get(&item.address) else {
                    continue;
                };
                let score = combine(&ScoreInputs {
                    confidence,
                    quality: quality.quality,
                    objective: quality.objective,
                });
                let better = best.get(&item.address).map(|b| score > b.score).unwrap_or(true);
                if better {
                    best.insert(
                        item.address,
                        RankedItem {
                            item: *item,
                            account: account.clone(),
                            score,
                            rank: 0,
                        },
                    );
                }
            }
        }

        let mut ranked: Vec<RankedItem> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| self.order(&a.item).cmp(&self.order(&b.item)))
        });
        ranked
    }

    fn order(&self, item: &StoreRef) -> u64 {
        self.discovered.get(&item.address).copied().unwrap_or(u64::MAX)
    }
}

/// Rank the best `options.count` items published across `network`
pub fn track_search(
    network: Arc<NetworkHandle>,
    lister: ItemLister,
    scorer: QualityScorer,
    options: SearchOptions,
    deliver: impl FnMut(Vec<RankedItem>) + Send + 'static,
) -> SearchHandle {
    let (control, mut control_rx) = mpsc::unbounded_channel::<usize>();
    let count = Arc::new(AtomicUsize::new(options.count));
    let net = network.clone();

    let subscription = Subscription::spawn(Box::new(deliver), move |mut sink| async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let combine: ScoreCombiner = options
            .combiner
            .clone()
            .unwrap_or_else(|| Arc::new(default_score) as ScoreCombiner);

        let views = net.track_view();
        let view_tx = tx.clone();
        let _view = views.clone().subscribe(move |view| {
            let _ = view_tx.send(Event::View(view));
        });

        let members = views
            .map(|view| {
                view.map(|v| v.trusted_members().map(|m| m.account.clone()).collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .distinct();
        let listing_tx = tx.clone();
        let _listings = track_dynamic_set(
            members,
            DynamicSetOptions::default(),
            move |account: &AccountId| lister(account),
            |listings: Vec<(AccountId, Vec<StoreRef>)>| listings,
            move |listings| {
                let _ = listing_tx.send(Event::Listings(listings));
            },
        );

        let (items_tx, items_rx) = watch::channel(Vec::<StoreRef>::new());
        let score_tx = tx.clone();
        let _scores = track_dynamic_set(
            Track::from_watch(items_rx),
            DynamicSetOptions::default(),
            move |item: &StoreRef| scorer(item),
            |scores: Vec<(StoreRef, ItemQuality)>| scores,
            move |scores| {
                let _ = score_tx.send(Event::Scores(scores));
            },
        );

        let mut ranking = Ranking {
            confidence: HashMap::new(),
            listings: Vec::new(),
            qualities: HashMap::new(),
            discovered: HashMap::new(),
            next_discovery: 0,
        };
        let mut wanted = options.count;
        let mut pool = 0usize;
        let mut deadline: Option<Instant> = None;
        let mut last: Option<Vec<RankedItem>> = None;
        info!(count = wanted, depth = net.depth(), "Search started");

        loop {
            let wake = deadline;
            let timer = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let first = tokio::select! {
                Some(event) = rx.recv() => event,
                Some(count) = control_rx.recv() => Event::Count(count),
                _ = timer => {
                    deadline = None;
                    rebalance(&net, &options, wanted, pool);
                    continue;
                }
                else => break,
            };

            let mut pending = Some(first);
            let mut recount = false;
            while let Some(event) = pending
                .take()
                .or_else(|| control_rx.try_recv().ok().map(Event::Count))
                .or_else(|| rx.try_recv().ok())
            {
                match event {
                    Event::View(view) => {
                        ranking.confidence = view
                            .map(|v| {
                                v.trusted_members()
                                    .map(|m| (m.account.clone(), m.confidence))
                                    .collect()
                            })
                            .unwrap_or_default();
                    }
                    Event::Listings(listings) => {
                        ranking.listings = listings;
                        let items = ranking.items();
                        items_tx.send_if_modified(|current| {
                            if *current == items {
                                return false;
                            }
                            *current = items;
                            true
                        });
                    }
                    Event::Scores(scores) => {
                        ranking.qualities = scores
                            .into_iter()
                            .map(|(item, quality)| (item.address, quality))
                            .collect();
                    }
                    Event::Count(count) => {
                        wanted = count;
                        recount = true;
                    }
                }
            }

            let candidates = ranking.candidates(combine.as_ref());
            pool = candidates.len();
            let results: Vec<RankedItem> = candidates
                .into_iter()
                .take(wanted)
                .enumerate()
                .map(|(i, mut item)| {
                    item.rank = i + 1;
                    item
                })
                .collect();

            if recount {
                deadline = None;
                debug!(count = wanted, pool, "Result count changed");
                rebalance(&net, &options, wanted, pool);
            } else {
                deadline = Some(Instant::now() + options.debounce);
            }

            if last.as_ref() == Some(&results) {
                continue;
            }
            last = Some(results.clone());
            if !sink.send(results) {
                break;
            }
        }
        Ok(())
    });

    SearchHandle {
        control,
        count,
        network,
        subscription,
    }
}

/// Move the network depth one step towards a pool of about `wanted` items
fn rebalance(network: &NetworkHandle, options: &SearchOptions, wanted: usize, pool: usize) {
    let depth = network.depth();
    if pool < wanted && depth < options.max_depth {
        debug!(pool, wanted, depth = depth + 1, "Widening search");
        network.change_depth(depth + 1);
    } else if pool > wanted.saturating_mul(2) && depth > options.min_depth {
        debug!(pool, wanted, depth = depth - 1, "Narrowing search");
        network.change_depth(depth - 1);
    }
}
