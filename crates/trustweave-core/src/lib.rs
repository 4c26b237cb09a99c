//! Trustweave Core Library
//!
//! Live tracking of replicated stores and a trust-weighted reputation
//! protocol built on top of it.
//!
//! ## Overview
//!
//! Every account owns replicated stores (key-value maps and append-only
//! collections) addressed by content-derived [`Address`]es. The tracking
//! primitives in [`track`] turn reads of those stores into live
//! subscriptions; the reputation layer composes them into a network view
//! that ranks content by how much the viewer trusts its authors.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ search        ranked top-N over network members' items         │
//! ├────────────────────────────────────────────────────────────────┤
//! │ network       depth-bounded transitive propagation             │
//! │ presence      signed announcements, online map, replication    │
//! ├────────────────────────────────────────────────────────────────┤
//! │ relations     trust + favorite + co-author + private blocks    │
//! │ trust         public trust edges, local block list             │
//! ├────────────────────────────────────────────────────────────────┤
//! │ track         store / derived / dynamic set / graph / filter   │
//! ├────────────────────────────────────────────────────────────────┤
//! │ store         registry, backends, snapshots                    │
//! │ identity      account + device keys      storage  redb state   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use trustweave_core::{
//!     track_network, MemoryBackend, StoreRegistry, TrustContext, TrustStatus, TrustStore,
//! };
//!
//! let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
//! let me = identity.account_id();
//! TrustStore::new(registry.clone(), me.clone()).set_trust(&friend, TrustStatus::Trusted).await?;
//!
//! let ctx = TrustContext::new(registry, me.clone());
//! let network = track_network(&ctx, &me, 2, |view| {
//!     for member in &view.members {
//!         println!("{} depth {} confidence {:.2}", member.account, member.depth, member.confidence);
//!     }
//! });
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod network;
pub mod presence;
pub mod relations;
pub mod search;
pub mod storage;
pub mod store;
pub mod track;
pub mod trust;

// Re-exports
pub use config::{default_data_dir, NodeConfig};
pub use error::{Error, Result};
pub use identity::{AccountId, Device, DeviceId, Keypair, LocalIdentity};
pub use network::{track_network, Membership, NetworkHandle, NetworkView, RelationRecord};
pub use presence::{
    track_online_members, GossipTransport, IrohTransport, LocalBus, PresenceConfig, PresenceMap,
    PresenceService, StoreReplicator,
};
pub use relations::{track_relations, Relation, Signal, SignalKind, TrustContext};
pub use search::{
    publish_item, published_items, stored_quality, track_search, ItemQuality, RankedItem,
    SearchHandle, SearchOptions,
};
pub use storage::LocalStorage;
pub use store::{Address, MemoryBackend, Snapshot, StoreOp, StoreRef, StoreRegistry, StoreShape, Value};
pub use track::{Subscription, Track};
pub use trust::{PrivateBlockList, TrustEdge, TrustStatus, TrustStore};
