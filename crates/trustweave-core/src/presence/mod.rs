//! Presence gossip
//!
//! Every device periodically announces itself on a shared channel with a
//! signed [`SignedEnvelope`]. When a device is heard for the first time, the
//! listener answers once on that device's own channel so that newcomers learn
//! about everyone already online without waiting a full interval.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  PresenceService task                                           │
//! │  ├── interval tick   -> broadcast own envelope, sweep map      │
//! │  ├── shared topic    -> verify, record, reply on first sight   │
//! │  └── own topic       -> verify, record                         │
//! │                                                                 │
//! │  PresenceMap (device -> last seen)                              │
//! │  ├── track_device_online / track_account_online                │
//! │  └── track_online_members (network members that are online)    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An announcement is accepted only when the envelope signature verifies,
//! the signing key is the announced device's key, the device record
//! cross-verifies with its account, and the account's authorization store
//! lists the device. Anything else is dropped without surfacing an error.
//! Authorization stores of other accounts arrive through
//! [`StoreReplicator`].

mod iroh_transport;
mod map;
mod message;
mod replication;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::identity::{is_device_authorized, AccountId, LocalIdentity};
use crate::network::NetworkHandle;
use crate::store::StoreRegistry;
use crate::track::{track_filtered_set, Track};

pub use iroh_transport::IrohTransport;
pub use map::{LastSeen, PresenceMap};
pub use message::{EnvelopeSignature, PresenceMessage, SignedEnvelope};
pub use replication::{ReplicaMessage, StoreReplicator};
pub use transport::{GossipTransport, LocalBus, Topic};

/// Timing of the presence protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Time between two announcements
    pub interval: Duration,
    /// How long a device counts as online after its last announcement
    pub online_window: Duration,
}

impl PresenceConfig {
    /// Config with the default window of three intervals
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            online_window: interval * 3,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self::with_interval(Duration::from_secs(10))
    }
}

impl From<&NodeConfig> for PresenceConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            interval: config.presence_interval(),
            online_window: config.online_window(),
        }
    }
}

struct Listener {
    identity: Arc<LocalIdentity>,
    transport: Arc<dyn GossipTransport>,
    registry: StoreRegistry,
    map: PresenceMap,
}

impl Listener {
    async fn announce(&self, topic: Topic) {
        let payload = match SignedEnvelope::presence(&self.identity).and_then(|e| e.to_bytes()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to sign presence");
                return;
            }
        };
        if let Err(e) = self.transport.broadcast(topic, payload).await {
            warn!(?topic, error = %e, "Failed to announce presence");
        }
    }

    /// Validate an incoming envelope; `None` means drop it
    async fn accept(&self, bytes: &[u8]) -> Option<SignedEnvelope> {
        let envelope = match SignedEnvelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Dropping undecodable presence");
                return None;
            }
        };
        if *envelope.sender() == self.identity.device_id() {
            return None;
        }
        if !envelope.verify() {
            debug!(device = %envelope.sender().short(), "Dropping presence with bad signatures");
            return None;
        }

        let device = envelope.value.device();
        match is_device_authorized(&self.registry, &device.account_id, &device.device_id).await {
            Ok(true) => Some(envelope),
            Ok(false) => {
                debug!(device = %device.device_id.short(), account = %device.account_id.short(), "Dropping presence of unauthorized device");
                None
            }
            Err(e) => {
                debug!(error = %e, "Dropping presence, authorization unreadable");
                None
            }
        }
    }

    async fn receive(&self, bytes: &[u8], reply: bool) {
        let Some(envelope) = self.accept(bytes).await else {
            return;
        };
        let device = envelope.value.device();
        let first = self.map.record(&device.device_id, &device.account_id);
        if first && reply {
            debug!(device = %device.device_id.short(), "Replying to new device");
            self.announce(Topic::for_device(&device.device_id)).await;
        }
    }
}

/// Running presence protocol of the local device
pub struct PresenceService {
    map: PresenceMap,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PresenceService {
    /// Join the presence channels and start announcing
    pub async fn spawn(
        identity: Arc<LocalIdentity>,
        transport: Arc<dyn GossipTransport>,
        registry: StoreRegistry,
        config: PresenceConfig,
    ) -> Result<Self> {
        let mut shared = transport.subscribe(Topic::shared()).await?;
        let mut direct = transport
            .subscribe(Topic::for_device(&identity.device_id()))
            .await?;

        let map = PresenceMap::new(config.online_window);
        let token = CancellationToken::new();
        let listener = Listener {
            identity,
            transport,
            registry,
            map: map.clone(),
        };
        info!(
            device = %listener.identity.device_id().short(),
            interval_ms = config.interval.as_millis() as u64,
            "Presence service started"
        );

        let cancel = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let own = listener.identity.current_device();
                        listener.map.record(&own.device_id, &own.account_id);
                        listener.map.sweep();
                        listener.announce(Topic::shared()).await;
                    }
                    Some(bytes) = shared.recv() => listener.receive(&bytes, true).await,
                    Some(bytes) = direct.recv() => listener.receive(&bytes, false).await,
                    else => break,
                }
            }
            debug!("Presence service stopped");
        });

        Ok(Self {
            map,
            token,
            task: Some(task),
        })
    }

    /// Devices heard so far
    pub fn map(&self) -> &PresenceMap {
        &self.map
    }

    /// Stop announcing and wait for the task to finish
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PresenceService {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Network members that are currently online
///
/// Follows the propagated network's non-blocked members and keeps those with
/// at least one online device, in network order.
pub fn track_online_members(network: &NetworkHandle, presence: &PresenceMap) -> Track<Vec<AccountId>> {
    let root = network
        .track_view()
        .map(|view| {
            view.map(|v| v.trusted_members().map(|m| m.account.clone()).collect())
                .unwrap_or_default()
        })
        .distinct();
    let presence = presence.clone();
    Track::new(move |deliver| {
        let presence = presence.clone();
        track_filtered_set(
            root.clone(),
            move |account: &AccountId| presence.track_account_online(account),
            deliver,
        )
    })
}
