//! Presence gossip over iroh-gossip

use std::collections::HashMap;

use futures::future::BoxFuture;
use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use iroh_gossip::api::{Event, GossipReceiver, GossipSender};
use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use iroh_gossip::proto::TopicId;
use n0_future::StreamExt;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::transport::{GossipTransport, Topic};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 256;

/// Gossip transport over an iroh endpoint
///
/// Each topic is joined on first use. Bootstrap peers must be known in
/// advance (see [`IrohTransport::add_peer_addr`]); peers found later through
/// the swarm are picked up by iroh-gossip itself.
pub struct IrohTransport {
    endpoint: Endpoint,
    gossip: Gossip,
    router: Router,
    static_provider: StaticProvider,
    bootstrap: SyncMutex<Vec<EndpointId>>,
    senders: Mutex<HashMap<Topic, GossipSender>>,
}

impl IrohTransport {
    /// Bind an endpoint and start the gossip protocol
    ///
    /// Passing the same `secret_key` across restarts keeps the endpoint id
    /// stable.
    pub async fn bind(secret_key: Option<SecretKey>) -> Result<Self> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| Error::Network(format!("Failed to bind endpoint: {}", e)))?;
        info!(endpoint_id = %endpoint.id(), "Endpoint bound");

        let gossip = Gossip::builder().spawn(endpoint.clone());
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, gossip.clone())
            .spawn();

        Ok(Self {
            endpoint,
            gossip,
            router,
            static_provider,
            bootstrap: SyncMutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// This node's endpoint id
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Full address other peers can dial
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Use `addr` as a bootstrap peer for topics joined from now on
    pub fn add_peer_addr(&self, addr: EndpointAddr) {
        info!(peer = %addr.id, "Adding bootstrap peer");
        self.bootstrap.lock().push(addr.id);
        self.static_provider.add_endpoint_info(addr);
    }

    /// Use `id` as a bootstrap peer, relying on discovery for its address
    pub fn add_peer(&self, id: EndpointId) {
        info!(peer = %id, "Adding bootstrap peer");
        self.bootstrap.lock().push(id);
    }

    async fn join(&self, topic: Topic) -> Result<(GossipSender, GossipReceiver)> {
        let peers = self.bootstrap.lock().clone();
        debug!(?topic, peers = peers.len(), "Joining topic");
        let joined = self
            .gossip
            .subscribe(TopicId::from_bytes(topic.0), peers)
            .await
            .map_err(|e| Error::Gossip(format!("Failed to subscribe: {}", e)))?;
        Ok(joined.split())
    }

    /// Stop the router and close the endpoint
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        info!("Gossip transport shut down");
        Ok(())
    }
}

/// Forward received messages until the subscriber goes away
async fn forward(topic: Topic, mut receiver: GossipReceiver, tx: Option<mpsc::Sender<Vec<u8>>>) {
    loop {
        match receiver.try_next().await {
            Ok(Some(Event::Received(msg))) => {
                if let Some(tx) = &tx {
                    if tx.send(msg.content.to_vec()).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Some(Event::NeighborUp(peer))) => debug!(?topic, %peer, "Neighbor joined"),
            Ok(Some(Event::NeighborDown(peer))) => debug!(?topic, %peer, "Neighbor left"),
            Ok(Some(Event::Lagged)) => warn!(?topic, "Lagged behind on topic"),
            Ok(None) => break,
            Err(e) => {
                warn!(?topic, error = ?e, "Error receiving from topic");
                break;
            }
        }
    }
    debug!(?topic, "Topic receiver closed");
}

impl GossipTransport for IrohTransport {
    fn broadcast(&self, topic: Topic, payload: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut senders = self.senders.lock().await;
            if !senders.contains_key(&topic) {
                let (sender, receiver) = self.join(topic).await?;
                // Keep the membership alive; messages are read by `subscribe`
                tokio::spawn(forward(topic, receiver, None));
                senders.insert(topic, sender);
            }
            let Some(sender) = senders.get(&topic) else {
                return Ok(());
            };
            sender
                .broadcast(payload.into())
                .await
                .map_err(|e| Error::Gossip(format!("Failed to broadcast: {}", e)))
        })
    }

    fn subscribe(&self, topic: Topic) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>>> {
        Box::pin(async move {
            let (_sender, receiver) = self.join(topic).await?;
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            tokio::spawn(forward(topic, receiver, Some(tx)));
            Ok(rx)
        })
    }
}

impl std::fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohTransport")
            .field("endpoint_id", &self.endpoint.id())
            .finish_non_exhaustive()
    }
}
