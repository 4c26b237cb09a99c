//! Live subscription to a single store

use std::sync::Arc;

use tracing::{debug, trace};

use super::Subscription;
use crate::store::{Snapshot, StoreRef, StoreRegistry};

/// Track the content of one store
///
/// Delivers the current state as soon as the store is open and again after
/// every change. `None` means the store is not reachable yet; the callback
/// fires again the moment it becomes reachable. Under a high write rate
/// intermediate states may be skipped, but the last delivered value is always
/// the most recent one and values never arrive out of order.
pub fn track_store(
    registry: &StoreRegistry,
    store: StoreRef,
    deliver: impl FnMut(Option<Arc<Snapshot>>) + Send + 'static,
) -> Subscription {
    let registry = registry.clone();
    Subscription::spawn(Box::new(deliver), move |mut sink| async move {
        let lease = registry.acquire(store.address, store.shape).await?;
        let mut rx = lease.watch();
        debug!(%store, "Tracking store");

        loop {
            let current = rx.borrow_and_update().clone();
            trace!(%store, known = current.is_some(), "Delivering store state");
            if !sink.send(current) {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }

        drop(lease);
        Ok(())
    })
}
