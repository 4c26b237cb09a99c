//! Per-account relation aggregation
//!
//! Merges every signal an account gives about others into one confidence
//! per related account:
//!
//! ```text
//!   trust store       trusted -> +1, blocked -> -1
//!   favorites         author of a favorited item -> 0.7
//!   documents         co-author of a shared document -> 0.9
//!   private blocks    -1, viewer's own account only
//! ```
//!
//! Positive signals for one account combine by probabilistic OR
//! (`1 - Π(1 - c)`); any block overrides them with -1.

use std::collections::BTreeMap;

use tracing::trace;

use crate::identity::AccountId;
use crate::store::{Address, Snapshot, StoreRef, StoreRegistry, Value};
use crate::track::{track_dynamic_set, DynamicSetOptions, Subscription, Track};
use crate::trust::{track_trust_edges, PrivateBlockList, TrustStatus};

/// Confidence of an explicit trust edge
pub const TRUST_CONFIDENCE: f64 = 1.0;
/// Confidence of an explicit or private block
pub const BLOCK_CONFIDENCE: f64 = -1.0;
/// Confidence given to the author of a favorited item
pub const FAVORITE_CONFIDENCE: f64 = 0.7;
/// Confidence given to the co-authors of a document
pub const COAUTHOR_CONFIDENCE: f64 = 0.9;

/// Where a signal came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Trust,
    Block,
    Favorite,
    CoAuthor,
    PrivateBlock,
}

/// One piece of evidence about another account
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub account: AccountId,
    pub confidence: f64,
    pub kind: SignalKind,
}

impl Signal {
    pub fn new(account: AccountId, kind: SignalKind) -> Self {
        let confidence = match kind {
            SignalKind::Trust => TRUST_CONFIDENCE,
            SignalKind::Block | SignalKind::PrivateBlock => BLOCK_CONFIDENCE,
            SignalKind::Favorite => FAVORITE_CONFIDENCE,
            SignalKind::CoAuthor => COAUTHOR_CONFIDENCE,
        };
        Self {
            account,
            confidence,
            kind,
        }
    }
}

/// Combined relation from one account to another
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub account: AccountId,
    /// In `[-1, 1]`; exactly -1 when blocked
    pub confidence: f64,
}

/// Probabilistic OR of confidences in `[0, 1]`
pub fn probabilistic_or(confidences: impl IntoIterator<Item = f64>) -> f64 {
    1.0 - confidences
        .into_iter()
        .fold(1.0, |rest, c| rest * (1.0 - c.clamp(0.0, 1.0)))
}

/// Fold the signals `owner` gives into one relation per account
///
/// Signals about `owner` itself are dropped. The result is sorted by
/// account id.
pub fn combine_relations(owner: &AccountId, signals: impl IntoIterator<Item = Signal>) -> Vec<Relation> {
    let mut by_account: BTreeMap<AccountId, (bool, Vec<f64>)> = BTreeMap::new();
    for signal in signals {
        if signal.account == *owner {
            continue;
        }
        let (blocked, positives) = by_account.entry(signal.account).or_default();
        if signal.confidence < 0.0 {
            *blocked = true;
        } else {
            positives.push(signal.confidence);
        }
    }

    by_account
        .into_iter()
        .map(|(account, (blocked, positives))| Relation {
            account,
            confidence: if blocked {
                BLOCK_CONFIDENCE
            } else {
                probabilistic_or(positives)
            },
        })
        .collect()
}

/// Favorites of `account`: a collection of references to item stores
pub fn favorites_store(account: &AccountId) -> StoreRef {
    StoreRef::collection(Address::derive("favorites", account))
}

/// Documents of `account`: a collection of references to document stores
pub fn documents_store(account: &AccountId) -> StoreRef {
    StoreRef::collection(Address::derive("documents", account))
}

/// Author recorded in an item store
pub fn item_author(snapshot: &Snapshot) -> Option<AccountId> {
    AccountId::parse(snapshot.data.get("author")?.as_text()?).ok()
}

/// Authors recorded in a document store, in document order
pub fn document_authors(snapshot: &Snapshot) -> Vec<AccountId> {
    match snapshot.data.get("authors") {
        Some(Value::List(items)) => items
            .iter()
            .filter_map(|v| AccountId::parse(v.as_text()?).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// What a relation tracker needs to know about the local node
#[derive(Clone)]
pub struct TrustContext {
    pub registry: StoreRegistry,
    /// Account of the viewing device
    pub viewer: AccountId,
    /// The viewer's private blocks
    pub private_blocks: Option<PrivateBlockList>,
}

impl TrustContext {
    pub fn new(registry: StoreRegistry, viewer: AccountId) -> Self {
        Self {
            registry,
            viewer,
            private_blocks: None,
        }
    }

    /// Apply the viewer's private block list to its own relations
    pub fn with_private_blocks(mut self, blocks: PrivateBlockList) -> Self {
        self.private_blocks = Some(blocks);
        self
    }
}

fn referenced_stores(store: Track<Option<std::sync::Arc<Snapshot>>>) -> Track<Vec<StoreRef>> {
    store.map(|snapshot| snapshot.map(|s| s.data.references()).unwrap_or_default())
}

fn track_trust_signals(registry: &StoreRegistry, account: &AccountId) -> Track<Vec<Signal>> {
    track_trust_edges(registry, account).map(|edges| {
        edges
            .into_iter()
            .map(|edge| {
                let kind = match edge.status {
                    TrustStatus::Trusted => SignalKind::Trust,
                    TrustStatus::Blocked => SignalKind::Block,
                };
                Signal::new(edge.target, kind)
            })
            .collect()
    })
}

fn track_favorite_signals(registry: &StoreRegistry, account: &AccountId) -> Track<Vec<Signal>> {
    let root = referenced_stores(Track::store(registry, favorites_store(account)));
    let registry = registry.clone();
    Track::new(move |deliver| {
        let registry = registry.clone();
        track_dynamic_set(
            root.clone(),
            DynamicSetOptions::default(),
            move |item: &StoreRef| {
                Track::store(&registry, *item).map(|s| s.and_then(|s| item_author(&s)))
            },
            |authors: Vec<(StoreRef, Option<AccountId>)>| {
                authors
                    .into_iter()
                    .filter_map(|(_, author)| author)
                    .map(|author| Signal::new(author, SignalKind::Favorite))
                    .collect::<Vec<_>>()
            },
            deliver,
        )
    })
}

fn track_coauthor_signals(registry: &StoreRegistry, account: &AccountId) -> Track<Vec<Signal>> {
    let root = referenced_stores(Track::store(registry, documents_store(account)));
    let registry = registry.clone();
    let account = account.clone();
    Track::new(move |deliver| {
        let registry = registry.clone();
        let account = account.clone();
        track_dynamic_set(
            root.clone(),
            DynamicSetOptions::default(),
            move |document: &StoreRef| {
                let account = account.clone();
                Track::store(&registry, *document).map(move |s| {
                    let authors = s.map(|s| document_authors(&s)).unwrap_or_default();
                    if authors.contains(&account) {
                        authors.into_iter().filter(|a| *a != account).collect::<Vec<_>>()
                    } else {
                        Vec::new()
                    }
                })
            },
            |documents: Vec<(StoreRef, Vec<AccountId>)>| {
                documents
                    .into_iter()
                    .flat_map(|(_, others)| others)
                    .map(|author| Signal::new(author, SignalKind::CoAuthor))
                    .collect::<Vec<_>>()
            },
            deliver,
        )
    })
}

fn track_private_block_signals(blocks: &PrivateBlockList) -> Track<Vec<Signal>> {
    blocks.track().map(|set| {
        set.into_iter()
            .map(|account| Signal::new(account, SignalKind::PrivateBlock))
            .collect()
    })
}

/// Live combined relations of `account`
///
/// Nothing is delivered until every signal family has reported once, and a
/// result equal to the previous one is not delivered again.
pub fn track_relations(ctx: &TrustContext, account: &AccountId) -> Track<Vec<Relation>> {
    let mut families = vec![
        ("trust".to_string(), track_trust_signals(&ctx.registry, account)),
        ("favorites".to_string(), track_favorite_signals(&ctx.registry, account)),
        ("documents".to_string(), track_coauthor_signals(&ctx.registry, account)),
    ];
    if *account == ctx.viewer {
        if let Some(blocks) = &ctx.private_blocks {
            families.push(("private".to_string(), track_private_block_signals(blocks)));
        }
    }

    let names: Vec<String> = families.iter().map(|(name, _)| name.clone()).collect();
    let families: BTreeMap<String, Track<Vec<Signal>>> = families.into_iter().collect();
    let expected = names.len();
    let owner = account.clone();

    Track::new(move |mut deliver| {
        let families = families.clone();
        let owner = owner.clone();
        let mut last: Option<Vec<Relation>> = None;
        track_dynamic_set(
            Track::constant(names.clone()),
            DynamicSetOptions::default(),
            move |name: &String| families.get(name).cloned().unwrap_or_else(|| Track::constant(Vec::new())),
            move |parts: Vec<(String, Vec<Signal>)>| {
                (parts.len() == expected)
                    .then(|| combine_relations(&owner, parts.into_iter().flat_map(|(_, s)| s)))
            },
            move |relations: Option<Vec<Relation>>| {
                let Some(relations) = relations else {
                    return;
                };
                if last.as_ref() == Some(&relations) {
                    return;
                }
                trace!(count = relations.len(), "Relations updated");
                last = Some(relations.clone());
                deliver(relations);
            },
        )
    })
}

/// Subscribe to the relations of `account`
pub fn subscribe_relations(
    ctx: &TrustContext,
    account: &AccountId,
    deliver: impl FnMut(Vec<Relation>) + Send + 'static,
) -> Subscription {
    track_relations(ctx, account).subscribe(deliver)
}
