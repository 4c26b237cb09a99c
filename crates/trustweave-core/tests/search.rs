//! Ranked Search Integration Tests
//!
//! Items are published into each account's published collection and scored
//! from numeric keys of the item store.
//!
//! ## What These Tests Verify
//!
//! - Results are ranked best first and only come from non-blocked members
//! - Score changes re-rank live
//! - The debounce widens or narrows the network towards the wanted pool
//! - Changing the count re-evaluates without waiting for the debounce

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use trustweave_core::search::{ScoreCombiner, ScoreInputs};
use trustweave_core::{
    publish_item, published_items, stored_quality, track_network, track_search, AccountId,
    Address, Keypair, MemoryBackend, NetworkHandle, RankedItem, SearchOptions, StoreOp, StoreRef,
    StoreRegistry, TrustContext, TrustStatus, TrustStore,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn account(seed: u8) -> AccountId {
    Keypair::from_seed(&[seed; 32]).account_id()
}

async fn trust(registry: &StoreRegistry, from: &AccountId, to: &AccountId, status: TrustStatus) {
    TrustStore::new(registry.clone(), from.clone())
        .set_trust(to, status)
        .await
        .unwrap();
}

/// Publish an item with the given scores under `account`
async fn item(registry: &StoreRegistry, account: &AccountId, tag: &str, quality: f64, objective: f64) -> StoreRef {
    let item = StoreRef::key_value(Address::derive("item", tag));
    registry
        .write(item.address, item.shape, StoreOp::put("quality", quality))
        .await
        .unwrap();
    registry
        .write(item.address, item.shape, StoreOp::put("objective", objective))
        .await
        .unwrap();
    publish_item(registry, account, item).await.unwrap();
    item
}

fn network(registry: &StoreRegistry, origin: &AccountId, depth: usize) -> Arc<NetworkHandle> {
    let ctx = TrustContext::new(registry.clone(), origin.clone());
    Arc::new(track_network(&ctx, origin, depth, |_| {}))
}

fn latest(rx: &mut mpsc::UnboundedReceiver<Vec<RankedItem>>) -> Option<Vec<RankedItem>> {
    let mut last = None;
    while let Ok(results) = rx.try_recv() {
        last = Some(results);
    }
    last
}

/// A chain 1 -> 2 -> 3 -> 4, each account publishing `per_account` items
async fn chain(registry: &StoreRegistry, per_account: usize) -> Vec<AccountId> {
    let accounts: Vec<AccountId> = (1u8..=4).map(account).collect();
    for pair in accounts.windows(2) {
        trust(registry, &pair[0], &pair[1], TrustStatus::Trusted).await;
    }
    for (i, owner) in accounts.iter().enumerate() {
        for n in 0..per_account {
            item(registry, owner, &format!("chain-{}-{}", i, n), 0.5, 0.5).await;
        }
    }
    accounts
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_ranked_best_first_without_blocked_authors() {
    let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
    let (a, b, c, erin) = (account(1), account(2), account(3), account(5));
    trust(&registry, &a, &b, TrustStatus::Trusted).await;
    trust(&registry, &b, &c, TrustStatus::Trusted).await;
    trust(&registry, &b, &erin, TrustStatus::Trusted).await;
    trust(&registry, &a, &erin, TrustStatus::Blocked).await;

    let a1 = item(&registry, &a, "a1", 0.5, 0.5).await;
    let b1 = item(&registry, &b, "b1", 0.9, 0.9).await;
    let c1 = item(&registry, &c, "c1", 1.0, 0.9).await;
    let e1 = item(&registry, &erin, "e1", 1.0, 1.0).await;

    let net = network(&registry, &a, 2);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = SearchOptions {
        count: 2,
        min_depth: 2,
        max_depth: 2,
        ..SearchOptions::default()
    };
    let _search = track_search(
        net,
        published_items(&registry),
        stored_quality(&registry),
        options,
        move |results| {
            let _ = tx.send(results);
        },
    );
    sleep(Duration::from_millis(150)).await;

    let results = latest(&mut rx).unwrap();
    let order: Vec<StoreRef> = results.iter().map(|r| r.item).collect();
    assert_eq!(order, vec![b1, c1]);
    assert_eq!(results[0].rank, 1);
    assert_eq!(results[1].rank, 2);
    assert_eq!(results[1].account, c);
    // (0.8 + 1.0 + 0.9) / 3
    assert!((results[1].score - 0.9).abs() < 1e-9);
    assert!(results.iter().all(|r| r.item != e1));

    // Raising a1's scores moves it to the top
    registry
        .write(a1.address, a1.shape, StoreOp::put("quality", 1.0))
        .await
        .unwrap();
    registry
        .write(a1.address, a1.shape, StoreOp::put("objective", 1.0))
        .await
        .unwrap();
    sleep(Duration::from_millis(150)).await;

    let order: Vec<StoreRef> = latest(&mut rx).unwrap().iter().map(|r| r.item).collect();
    assert_eq!(order, vec![a1, b1]);
}

#[tokio::test]
async fn test_custom_combiner() {
    let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
    let (a, b) = (account(1), account(2));
    trust(&registry, &a, &b, TrustStatus::Trusted).await;
    let relevant = item(&registry, &a, "relevant", 0.1, 0.9).await;
    let polished = item(&registry, &b, "polished", 0.9, 0.1).await;

    let objective_only: ScoreCombiner = Arc::new(|inputs: &ScoreInputs| inputs.objective);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _search = track_search(
        network(&registry, &a, 1),
        published_items(&registry),
        stored_quality(&registry),
        SearchOptions {
            count: 2,
            min_depth: 1,
            max_depth: 1,
            combiner: Some(objective_only),
            ..SearchOptions::default()
        },
        move |results| {
            let _ = tx.send(results);
        },
    );
    sleep(Duration::from_millis(150)).await;

    let results = latest(&mut rx).unwrap();
    assert_eq!(results[0].item, relevant);
    assert_eq!(results[1].item, polished);
    assert!((results[0].score - 0.9).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_widens_until_pool_is_large_enough() {
    let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
    let accounts = chain(&registry, 1).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let search = track_search(
        network(&registry, &accounts[0], 1),
        published_items(&registry),
        stored_quality(&registry),
        SearchOptions {
            count: 3,
            min_depth: 1,
            max_depth: 4,
            ..SearchOptions::default()
        },
        move |results| {
            let _ = tx.send(results);
        },
    );
    sleep(Duration::from_secs(30)).await;

    // depth 1 reaches two accounts, depth 2 the third one
    assert_eq!(search.depth(), 2);
    assert_eq!(latest(&mut rx).unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_narrows_an_oversized_pool() {
    let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
    let accounts = chain(&registry, 3).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let search = track_search(
        network(&registry, &accounts[0], 3),
        published_items(&registry),
        stored_quality(&registry),
        SearchOptions {
            count: 2,
            min_depth: 1,
            max_depth: 4,
            ..SearchOptions::default()
        },
        move |results| {
            let _ = tx.send(results);
        },
    );
    sleep(Duration::from_secs(30)).await;

    // Even depth 1 holds six items, more than twice the count
    assert_eq!(search.depth(), 1);
    assert_eq!(latest(&mut rx).unwrap().len(), 2);
}

#[tokio::test]
async fn test_set_count_rebalances_immediately() {
    let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
    let accounts = chain(&registry, 1).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let search = track_search(
        network(&registry, &accounts[0], 1),
        published_items(&registry),
        stored_quality(&registry),
        SearchOptions {
            count: 2,
            debounce: Duration::from_secs(3600),
            min_depth: 1,
            max_depth: 4,
            combiner: None,
        },
        move |results| {
            let _ = tx.send(results);
        },
    );
    sleep(Duration::from_millis(150)).await;
    assert_eq!(latest(&mut rx).unwrap().len(), 2);
    assert_eq!(search.depth(), 1);

    search.set_count(3);
    sleep(Duration::from_millis(150)).await;
    assert_eq!(search.count(), 3);
    assert_eq!(search.depth(), 2);
    assert_eq!(latest(&mut rx).unwrap().len(), 3);

    search.unsubscribe();
}
