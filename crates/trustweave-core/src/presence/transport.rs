//! Broadcast channels for presence gossip

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::identity::DeviceId;

const TOPIC_SEED: &str = "trustweave:presence:v1";
const REPLICA_TOPIC_SEED: &str = "trustweave:replicas:v1";
const CHANNEL_CAPACITY: usize = 256;

/// Name of a broadcast channel
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic(pub [u8; 32]);

impl Topic {
    /// Channel every device announces itself on
    pub fn shared() -> Self {
        Self(*blake3::hash(TOPIC_SEED.as_bytes()).as_bytes())
    }

    /// Channel carrying replicated store state
    pub fn replicas() -> Self {
        Self(*blake3::hash(REPLICA_TOPIC_SEED.as_bytes()).as_bytes())
    }

    /// Channel for replies addressed to one device
    pub fn for_device(device: &DeviceId) -> Self {
        let seed = format!("{}:{}", TOPIC_SEED, device);
        Self(*blake3::hash(seed.as_bytes()).as_bytes())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", hex::encode(&self.0[..4]))
    }
}

/// A broadcast medium shared by many devices
///
/// Delivery is best effort. A subscriber that falls behind loses messages
/// rather than slowing down the sender.
pub trait GossipTransport: Send + Sync {
    /// Publish `payload` to every subscriber of `topic`
    fn broadcast(&self, topic: Topic, payload: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    /// Receive everything published to `topic` from now on
    fn subscribe(&self, topic: Topic) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>>>;
}

/// In-process transport connecting every device that shares the bus
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Arc<Mutex<HashMap<Topic, broadcast::Sender<Vec<u8>>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: Topic) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .lock()
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl GossipTransport for LocalBus {
    fn broadcast(&self, topic: Topic, payload: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // No subscribers is not an error on a broadcast medium
            let receivers = self.sender(topic).send(payload).unwrap_or(0);
            debug!(?topic, receivers, "Broadcast on local bus");
            Ok(())
        })
    }

    fn subscribe(&self, topic: Topic) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<u8>>>> {
        Box::pin(async move {
            let mut source = self.sender(topic).subscribe();
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            tokio::spawn(async move {
                loop {
                    match source.recv().await {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(?topic, skipped, "Lagged behind on local bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            Ok(rx)
        })
    }
}
