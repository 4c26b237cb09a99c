//! Reactive tracking primitives
//!
//! A tracker turns a read of replicated data into a live subscription: the
//! delivery callback fires with the current value and again on every change
//! until the [`Subscription`] is released.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Subscription (one per Track* call)                             │
//! │  ├── CancellationToken  -> stops the tracker task              │
//! │  ├── delivery gate      -> no callback once released           │
//! │  └── tracker task       -> owns every child subscription       │
//! │                                                                 │
//! │  Composition                                                    │
//! │  ├── track_store              store -> snapshot                │
//! │  ├── track_derived_address    pointer -> downstream tracker    │
//! │  ├── track_dynamic_set        list -> one tracker per element  │
//! │  ├── track_recursive_graph    store -> reachable store set     │
//! │  └── track_filtered_set       list + condition -> sublist      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each tracker task owns its children, so releasing a subscription tears
//! down the whole tree below it. Deliveries for one subscription are
//! strictly sequential because they all come from its single task.
//!
//! Trackers spawn tasks and therefore must be started inside a tokio runtime.

mod deps;
mod derived;
mod dynamic;
mod filtered;
mod graph;
mod store;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::{Error, Result};
use crate::store::{Snapshot, StoreRef, StoreRegistry};

pub use deps::DependencyTable;
pub use derived::track_derived_address;
pub use dynamic::{flatten, track_dynamic_set, DedupCode, DynamicBranch, DynamicSetOptions};
pub use filtered::track_filtered_set;
pub use graph::{track_recursive_fingerprint, track_recursive_graph, ReachableSet, ReachableStore};
pub use store::track_store;

/// Delivery callback of a tracker
pub type Deliver<T> = Box<dyn FnMut(T) + Send + 'static>;

struct SubscriptionInner {
    token: CancellationToken,
    /// `true` while deliveries are allowed. Reentrant so that a callback may
    /// release its own subscription.
    open: ReentrantMutex<Cell<bool>>,
    failure: Mutex<Option<Arc<Error>>>,
}

impl SubscriptionInner {
    fn close(&self) {
        self.token.cancel();
        let open = self.open.lock();
        open.set(false);
    }
}

/// Live handle to a tracker
///
/// Releasing it (via [`Subscription::unsubscribe`] or by dropping it) stops
/// the tracker and every subscription it created. Once `unsubscribe` returns,
/// the delivery callback is never invoked again; a delivery that was already
/// running on another thread finishes first.
#[must_use = "dropping a Subscription releases it immediately"]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Spawn a tracker task
    ///
    /// `run` receives the gated sink for this subscription. An `Err` return is
    /// a programming error in how the tracker was composed: it is logged and
    /// kept in [`Subscription::failure`].
    pub(crate) fn spawn<T, F, Fut>(deliver: Deliver<T>, run: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce(Sink<T>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = Arc::new(SubscriptionInner {
            token: CancellationToken::new(),
            open: ReentrantMutex::new(Cell::new(true)),
            failure: Mutex::new(None),
        });
        let sink = Sink {
            inner: inner.clone(),
            deliver,
        };
        let fut = run(sink);
        let token = inner.token.clone();
        let task_inner = inner.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = fut => {
                    if let Err(e) = result {
                        error!(error = %e, "Tracker failed");
                        *task_inner.failure.lock() = Some(Arc::new(e));
                    }
                }
            }
        });

        Self { inner }
    }

    /// Release this subscription and everything it created
    pub fn unsubscribe(self) {
        self.inner.close();
    }

    /// Whether the subscription has not been released yet
    pub fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    /// The error that stopped this tracker, if any
    pub fn failure(&self) -> Option<Arc<Error>> {
        self.inner.failure.lock().clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .field("failed", &self.inner.failure.lock().is_some())
            .finish()
    }
}

/// Gated delivery end of a subscription, owned by its tracker task
pub(crate) struct Sink<T> {
    inner: Arc<SubscriptionInner>,
    deliver: Deliver<T>,
}

impl<T> Sink<T> {
    /// Deliver a value. Returns `false` once the subscription is released.
    pub(crate) fn send(&mut self, value: T) -> bool {
        let open = self.inner.open.lock();
        if !open.get() {
            return false;
        }
        (self.deliver)(value);
        true
    }
}

/// A composable description of a live value
///
/// A `Track` does nothing until subscribed. Subscribing twice starts two
/// independent trackers (which still share open store handles through the
/// [`StoreRegistry`]).
pub struct Track<T> {
    start: Arc<dyn Fn(Deliver<T>) -> Subscription + Send + Sync>,
}

impl<T> Clone for Track<T> {
    fn clone(&self) -> Self {
        Self {
            start: self.start.clone(),
        }
    }
}

impl<T: Send + 'static> Track<T> {
    /// Build a track from a function that starts a subscription
    pub fn new(start: impl Fn(Deliver<T>) -> Subscription + Send + Sync + 'static) -> Self {
        Self {
            start: Arc::new(start),
        }
    }

    /// Start tracking
    pub fn subscribe(&self, deliver: impl FnMut(T) + Send + 'static) -> Subscription {
        (self.start)(Box::new(deliver))
    }

    /// Transform every delivered value
    pub fn map<U: Send + 'static>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Track<U> {
        let f = Arc::new(f);
        Track::new(move |mut deliver: Deliver<U>| {
            let f = f.clone();
            self.subscribe(move |value| deliver(f(value)))
        })
    }

    /// Skip values equal to the previously delivered one
    pub fn distinct(self) -> Self
    where
        T: PartialEq + Clone,
    {
        Track::new(move |mut deliver: Deliver<T>| {
            let mut last: Option<T> = None;
            self.subscribe(move |value| {
                if last.as_ref() != Some(&value) {
                    last = Some(value.clone());
                    deliver(value);
                }
            })
        })
    }

    /// A value that never changes
    pub fn constant(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Track::new(move |deliver| {
            let value = value.clone();
            Subscription::spawn(deliver, move |mut sink| async move {
                sink.send(value);
                std::future::pending::<()>().await;
                Ok(())
            })
        })
    }

    /// Follow a watch channel
    pub fn from_watch(rx: watch::Receiver<T>) -> Self
    where
        T: Clone + Sync,
    {
        Track::new(move |deliver| {
            let mut rx = rx.clone();
            Subscription::spawn(deliver, move |mut sink| async move {
                loop {
                    let current = rx.borrow_and_update().clone();
                    if !sink.send(current) {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            })
        })
    }
}

impl Track<Option<Arc<Snapshot>>> {
    /// Track one store
    pub fn store(registry: &StoreRegistry, store: StoreRef) -> Self {
        let registry = registry.clone();
        Track::new(move |deliver| track_store(&registry, store, deliver))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{recorder, settle};
    use super::*;

    #[tokio::test]
    async fn test_constant_delivers_once() {
        let (seen, deliver) = recorder();
        let sub = Track::constant(7u32).subscribe(deliver);
        settle().await;
        assert_eq!(*seen.lock(), vec![7]);
        sub.unsubscribe();
    }

    #[tokio::test]
    async fn test_map_and_from_watch() {
        let (tx, rx) = watch::channel(1u32);
        let (seen, deliver) = recorder();
        let sub = Track::from_watch(rx).map(|v| v * 10).subscribe(deliver);
        settle().await;
        tx.send(2).unwrap();
        settle().await;
        assert_eq!(*seen.lock(), vec![10, 20]);

        sub.unsubscribe();
        tx.send(3).unwrap();
        settle().await;
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_distinct_skips_repeats() {
        let (tx, rx) = watch::channel(1u32);
        let (seen, deliver) = recorder();
        let _sub = Track::from_watch(rx).map(|v| v / 2).distinct().subscribe(deliver);
        settle().await;
        tx.send(2).unwrap();
        settle().await;
        tx.send(3).unwrap();
        settle().await;
        assert_eq!(*seen.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_unsubscribe_from_inside_callback() {
        let (tx, rx) = watch::channel(0u32);
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let (seen, mut record) = recorder();
        let slot_in = slot.clone();
        let sub = Track::from_watch(rx).subscribe(move |v| {
            record(v);
            if v == 1 {
                if let Some(sub) = slot_in.lock().take() {
                    sub.unsubscribe();
                }
            }
        });
        *slot.lock() = Some(sub);
        settle().await;
        tx.send(1).unwrap();
        settle().await;
        let _ = tx.send(2);
        settle().await;
        assert_eq!(*seen.lock(), vec![0, 1]);
    }
}
