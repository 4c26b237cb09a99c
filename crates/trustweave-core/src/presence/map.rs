//! In-memory "last seen" map of devices

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::identity::{AccountId, DeviceId};
use crate::track::Track;

/// When a device was last heard from, and for which account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSeen {
    pub account: AccountId,
    pub at: Instant,
}

struct Entry {
    seen: LastSeen,
    online: bool,
}

struct MapInner {
    entries: Mutex<HashMap<DeviceId, Entry>>,
    version: watch::Sender<u64>,
    window: Duration,
}

impl MapInner {
    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

/// Devices heard on the presence channel
///
/// Not persisted; starts empty on every run. A device counts as online until
/// `window` has passed since its last accepted announcement and a
/// [`sweep`](Self::sweep) notices it.
#[derive(Clone)]
pub struct PresenceMap {
    inner: Arc<MapInner>,
}

impl PresenceMap {
    pub fn new(window: Duration) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(MapInner {
                entries: Mutex::new(HashMap::new()),
                version,
                window,
            }),
        }
    }

    /// Record an accepted announcement
    ///
    /// Returns `true` if the device was not known before.
    pub fn record(&self, device: &DeviceId, account: &AccountId) -> bool {
        let now = Instant::now();
        let (first, came_online) = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(device) {
                Some(entry) => {
                    let came_online = !entry.online || entry.seen.account != *account;
                    entry.seen = LastSeen {
                        account: account.clone(),
                        at: now,
                    };
                    entry.online = true;
                    (false, came_online)
                }
                None => {
                    entries.insert(
                        device.clone(),
                        Entry {
                            seen: LastSeen {
                                account: account.clone(),
                                at: now,
                            },
                            online: true,
                        },
                    );
                    (true, true)
                }
            }
        };
        if came_online {
            debug!(device = %device.short(), account = %account.short(), "Device online");
            self.inner.bump();
        } else {
            trace!(device = %device.short(), "Presence refreshed");
        }
        first
    }

    /// Mark devices not heard from within the window as offline
    ///
    /// Returns the number of devices that went offline.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let went_offline = {
            let mut entries = self.inner.entries.lock();
            let mut count = 0;
            for (device, entry) in entries.iter_mut() {
                if entry.online && now.duration_since(entry.seen.at) >= self.inner.window {
                    entry.online = false;
                    count += 1;
                    debug!(device = %device.short(), "Device offline");
                }
            }
            count
        };
        if went_offline > 0 {
            self.inner.bump();
        }
        went_offline
    }

    /// Last accepted announcement of `device`
    pub fn last_seen(&self, device: &DeviceId) -> Option<LastSeen> {
        self.inner.entries.lock().get(device).map(|e| e.seen.clone())
    }

    pub fn is_device_online(&self, device: &DeviceId) -> bool {
        self.inner
            .entries
            .lock()
            .get(device)
            .map(|e| e.online)
            .unwrap_or(false)
    }

    /// Whether any device of `account` is online
    pub fn is_account_online(&self, account: &AccountId) -> bool {
        self.inner
            .entries
            .lock()
            .values()
            .any(|e| e.online && e.seen.account == *account)
    }

    /// Devices currently online, with their accounts
    pub fn online_devices(&self) -> Vec<(DeviceId, AccountId)> {
        let mut devices: Vec<_> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.online)
            .map(|(d, e)| (d.clone(), e.seen.account.clone()))
            .collect();
        devices.sort();
        devices
    }

    /// Live online status of one device
    pub fn track_device_online(&self, device: &DeviceId) -> Track<bool> {
        let map = self.clone();
        let device = device.clone();
        Track::from_watch(self.inner.version.subscribe())
            .map(move |_| map.is_device_online(&device))
            .distinct()
    }

    /// Live online status of an account (any of its devices)
    pub fn track_account_online(&self, account: &AccountId) -> Track<bool> {
        let map = self.clone();
        let account = account.clone();
        Track::from_watch(self.inner.version.subscribe())
            .map(move |_| map.is_account_online(&account))
            .distinct()
    }
}
