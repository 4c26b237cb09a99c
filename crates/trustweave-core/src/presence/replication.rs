//! Store replication over the gossip transport
//!
//! Presence is only accepted for devices listed in their account's
//! authorization store, so that store has to reach the listener first. Each
//! node periodically broadcasts the full Automerge state of the stores it
//! owns; receivers merge whatever arrives into their own backend.
//!
//! ```text
//! {
//!   "address": <base58>,
//!   "shape": "key-value" | "collection",
//!   "data": <hex of the saved Automerge document>
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::transport::{GossipTransport, Topic};
use crate::error::{Error, Result};
use crate::store::{Address, StoreRef, StoreRegistry, StoreShape};

/// Full state of one store, as sent on the replica channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaMessage {
    pub address: Address,
    pub shape: StoreShape,
    /// Hex of the saved document
    pub data: String,
}

impl ReplicaMessage {
    /// Encode the local state of `store`, `None` if it is unknown here
    pub fn export(registry: &StoreRegistry, store: &StoreRef) -> Option<Self> {
        let (shape, bytes) = registry.export(&store.address)?;
        Some(Self {
            address: store.address,
            shape,
            data: hex::encode(bytes),
        })
    }

    /// Merge into the local backend. Returns whether anything changed.
    pub fn apply(&self, registry: &StoreRegistry) -> Result<bool> {
        let bytes = hex::decode(&self.data)
            .map_err(|e| Error::Serialization(format!("Invalid replica data: {}", e)))?;
        registry.import(self.address, self.shape, &bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Broadcasts a fixed set of local stores and merges what peers send
pub struct StoreReplicator {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StoreReplicator {
    /// Join the replica channel and start broadcasting `stores` every
    /// `interval`
    pub async fn spawn(
        transport: Arc<dyn GossipTransport>,
        registry: StoreRegistry,
        stores: Vec<StoreRef>,
        interval: Duration,
    ) -> Result<Self> {
        let mut incoming = transport.subscribe(Topic::replicas()).await?;
        let token = CancellationToken::new();
        let cancel = token.clone();
        info!(stores = stores.len(), "Store replication started");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for store in &stores {
                            let Some(message) = ReplicaMessage::export(&registry, store) else {
                                trace!(%store, "Nothing to replicate yet");
                                continue;
                            };
                            let payload = match message.to_bytes() {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!(%store, error = %e, "Failed to encode replica");
                                    continue;
                                }
                            };
                            if let Err(e) = transport.broadcast(Topic::replicas(), payload).await {
                                warn!(%store, error = %e, "Failed to broadcast replica");
                            }
                        }
                    }
                    Some(bytes) = incoming.recv() => {
                        match ReplicaMessage::from_bytes(&bytes).and_then(|m| m.apply(&registry).map(|c| (m.address, c))) {
                            Ok((address, true)) => debug!(%address, "Replica merged from peer"),
                            Ok((_, false)) => {}
                            Err(e) => debug!(error = %e, "Dropping replica"),
                        }
                    }
                    else => break,
                }
            }
            debug!("Store replication stopped");
        });

        Ok(Self {
            token,
            task: Some(task),
        })
    }

    /// Stop broadcasting and wait for the task to finish
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StoreReplicator {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
