//! Trust Propagation End-to-End Tests
//!
//! These tests drive the whole reputation stack from store writes: trust
//! stores, favorites and private blocks feed relation trackers, which feed
//! the transitive propagator.
//!
//! ## What These Tests Verify
//!
//! - Chain attenuation (A -> B -> C gives C 0.8 at depth 2)
//! - Depth changes release and resume relation trackers
//! - A tracker shared by two paths lives until the last path goes away
//! - Blocks take precedence over trust
//! - Implicit signals (favorites) count as relations

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::mpsc;
use trustweave_core::relations::favorites_store;
use trustweave_core::{
    track_network, AccountId, Address, Keypair, LocalStorage, MemoryBackend, NetworkView,
    PrivateBlockList, StoreOp, StoreRef, StoreRegistry, TrustContext, TrustStatus, TrustStore,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn account(seed: u8) -> AccountId {
    Keypair::from_seed(&[seed; 32]).account_id()
}

fn registry() -> StoreRegistry {
    StoreRegistry::new(Arc::new(MemoryBackend::new()))
}

async fn trust(registry: &StoreRegistry, from: &AccountId, to: &AccountId, status: TrustStatus) {
    TrustStore::new(registry.clone(), from.clone())
        .set_trust(to, status)
        .await
        .unwrap();
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Drain the channel, returning how many views arrived and the last one
fn drain(rx: &mut mpsc::UnboundedReceiver<NetworkView>) -> (usize, Option<NetworkView>) {
    let mut count = 0;
    let mut last = None;
    while let Ok(view) = rx.try_recv() {
        count += 1;
        last = Some(view);
    }
    (count, last)
}

fn summary(view: &NetworkView) -> Vec<(AccountId, f64, usize)> {
    view.members
        .iter()
        .map(|m| (m.account.clone(), (m.confidence * 1000.0).round() / 1000.0, m.depth))
        .collect()
}

fn sorted(mut rows: Vec<(AccountId, f64, usize)>) -> Vec<(AccountId, f64, usize)> {
    rows.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
    rows
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_chain_then_shrink_depth() {
    let registry = registry();
    let (a, b, c, d) = (account(1), account(2), account(3), account(4));
    trust(&registry, &a, &b, TrustStatus::Trusted).await;
    trust(&registry, &b, &c, TrustStatus::Trusted).await;
    trust(&registry, &c, &d, TrustStatus::Trusted).await;

    let ctx = TrustContext::new(registry.clone(), a.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let network = track_network(&ctx, &a, 2, move |view| {
        let _ = tx.send(view);
    });
    settle().await;

    let (_, view) = drain(&mut rx);
    let view = view.expect("a view should be delivered");
    assert_eq!(
        summary(&view),
        sorted(vec![(a.clone(), 1.0, 0), (b.clone(), 1.0, 1), (c.clone(), 0.8, 2)])
    );
    assert!(network.tracked_accounts().contains(&c));
    assert!(view.member(&d).is_none(), "d is beyond the ceiling");

    network.change_depth(1);
    settle().await;

    let (_, view) = drain(&mut rx);
    let view = view.expect("shrinking the depth should deliver");
    assert_eq!(summary(&view), sorted(vec![(a.clone(), 1.0, 0), (b.clone(), 1.0, 1)]));
    assert!(!network.tracked_accounts().contains(&c));

    // Growing again resumes discovery from the frontier
    network.change_depth(3);
    settle().await;

    let (_, view) = drain(&mut rx);
    let view = view.unwrap();
    let member = view.member(&d).expect("d within three hops");
    assert_eq!(member.depth, 3);
    assert!((member.confidence - 0.64).abs() < 1e-9);
}

#[tokio::test]
async fn test_account_reached_by_two_paths_released_with_the_last() {
    let registry = registry();
    let (a, b, c, d) = (account(1), account(2), account(3), account(4));
    trust(&registry, &a, &b, TrustStatus::Trusted).await;
    trust(&registry, &a, &c, TrustStatus::Trusted).await;
    trust(&registry, &b, &d, TrustStatus::Trusted).await;
    trust(&registry, &c, &d, TrustStatus::Trusted).await;

    let ctx = TrustContext::new(registry.clone(), a.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let network = track_network(&ctx, &a, 2, move |view| {
        let _ = tx.send(view);
    });
    settle().await;

    let (_, view) = drain(&mut rx);
    let member = view.unwrap().member(&d).cloned().expect("d reached through b and c");
    assert_eq!(member.depth, 2);
    assert!(network.tracked_accounts().contains(&d));

    // One path gone: c still needs d
    TrustStore::new(registry.clone(), b.clone()).clear(&d).await.unwrap();
    settle().await;
    let (_, view) = drain(&mut rx);
    assert!(view.unwrap().member(&d).is_some());
    assert!(network.tracked_accounts().contains(&d));

    // Last path gone
    TrustStore::new(registry.clone(), c.clone()).clear(&d).await.unwrap();
    settle().await;
    let (_, view) = drain(&mut rx);
    assert!(view.unwrap().member(&d).is_none());
    assert!(!network.tracked_accounts().contains(&d));
    assert!(network.tracked_accounts().contains(&b));

    network.unsubscribe();
}

#[tokio::test]
async fn test_setting_same_depth_is_a_no_op() {
    let registry = registry();
    let (a, b) = (account(1), account(2));
    trust(&registry, &a, &b, TrustStatus::Trusted).await;

    let ctx = TrustContext::new(registry, a.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let network = track_network(&ctx, &a, 2, move |view| {
        let _ = tx.send(view);
    });
    settle().await;
    let (count, _) = drain(&mut rx);
    assert!(count >= 1);

    network.change_depth(2);
    settle().await;
    let (count, _) = drain(&mut rx);
    assert_eq!(count, 0);
    assert_eq!(network.depth(), 2);
}

#[tokio::test]
async fn test_direct_block_takes_precedence() {
    let registry = registry();
    let (a, b, c) = (account(1), account(2), account(3));
    trust(&registry, &a, &b, TrustStatus::Trusted).await;
    trust(&registry, &b, &c, TrustStatus::Trusted).await;
    trust(&registry, &a, &c, TrustStatus::Blocked).await;

    let ctx = TrustContext::new(registry.clone(), a.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _network = track_network(&ctx, &a, 3, move |view| {
        let _ = tx.send(view);
    });
    settle().await;

    let view = drain(&mut rx).1.unwrap();
    let blocked = view.member(&c).unwrap();
    assert_eq!(blocked.confidence, -1.0);
    assert_eq!(blocked.depth, 1);
    assert!(view.trusted_members().all(|m| m.account != c));

    // Lifting the block turns the indirect trust back on
    TrustStore::new(registry.clone(), a.clone()).clear(&c).await.unwrap();
    settle().await;
    let view = drain(&mut rx).1.unwrap();
    let member = view.member(&c).unwrap();
    assert!((member.confidence - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn test_private_block_hides_account_from_viewer() {
    let dir = tempdir().unwrap();
    let storage = LocalStorage::new(dir.path().join("local.redb")).unwrap();
    let blocks = PrivateBlockList::open(storage).unwrap();

    let registry = registry();
    let (a, b, c) = (account(1), account(2), account(3));
    trust(&registry, &a, &b, TrustStatus::Trusted).await;
    trust(&registry, &b, &c, TrustStatus::Trusted).await;

    let ctx = TrustContext::new(registry, a.clone()).with_private_blocks(blocks.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let network = track_network(&ctx, &a, 2, move |view| {
        let _ = tx.send(view);
    });
    settle().await;
    assert!(drain(&mut rx).1.unwrap().member(&c).is_some());

    blocks.block(&b).unwrap();
    settle().await;

    let view = drain(&mut rx).1.unwrap();
    assert_eq!(view.member(&b).unwrap().confidence, -1.0);
    assert!(view.member(&c).is_none(), "nothing is discovered through a blocked account");
    assert!(!network.tracked_accounts().contains(&c));
}

#[tokio::test]
async fn test_favorite_is_an_implicit_relation() {
    let registry = registry();
    let (a, b) = (account(1), account(2));
    let item = StoreRef::key_value(Address::derive("item", "b-note"));
    registry
        .write(item.address, item.shape, StoreOp::put("author", b.as_str()))
        .await
        .unwrap();
    let favorites = favorites_store(&a);
    registry
        .write(favorites.address, favorites.shape, StoreOp::append(item))
        .await
        .unwrap();

    let ctx = TrustContext::new(registry, a.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _network = track_network(&ctx, &a, 1, move |view| {
        let _ = tx.send(view);
    });
    settle().await;

    let view = drain(&mut rx).1.unwrap();
    let member = view.member(&b).unwrap();
    assert!((member.confidence - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn test_unsubscribe_releases_every_store() {
    let backend = MemoryBackend::new();
    let registry = StoreRegistry::new(Arc::new(backend.clone()));
    let (a, b, c) = (account(1), account(2), account(3));
    trust(&registry, &a, &b, TrustStatus::Trusted).await;
    trust(&registry, &b, &c, TrustStatus::Trusted).await;

    let ctx = TrustContext::new(registry.clone(), a.clone());
    let network = track_network(&ctx, &a, 3, |_| {});
    settle().await;
    assert!(registry.open_count() > 0);

    network.unsubscribe();
    settle().await;
    assert_eq!(registry.open_count(), 0);
}
