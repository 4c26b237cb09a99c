//! Tracking through a pointer whose target changes

use tokio::sync::mpsc;
use tracing::debug;

use super::{Subscription, Track};

/// Track the value behind a changing pointer
///
/// `root` yields the current pointer (for example a [`StoreRef`] stored
/// under a key). Whenever it changes, the downstream tracker for the old
/// pointer is released before the one for the new pointer starts, and values
/// still in flight from the old downstream are discarded. While the pointer
/// is unset the consumer receives `None`.
///
/// [`StoreRef`]: crate::store::StoreRef
pub fn track_derived_address<K, T>(
    root: Track<Option<K>>,
    downstream: impl Fn(&K) -> Track<T> + Send + Sync + 'static,
    deliver: impl FnMut(Option<T>) + Send + 'static,
) -> Subscription
where
    K: PartialEq + Clone + Send + std::fmt::Debug + 'static,
    T: Send + 'static,
{
    Subscription::spawn(Box::new(deliver), move |mut sink| async move {
        let (root_tx, mut root_rx) = mpsc::unbounded_channel::<Option<K>>();
        let (value_tx, mut value_rx) = mpsc::unbounded_channel::<(u64, T)>();
        let _root = root.subscribe(move |pointer| {
            let _ = root_tx.send(pointer);
        });

        let mut current: Option<Option<K>> = None;
        let mut child: Option<Subscription> = None;
        let mut generation = 0u64;

        loop {
            tokio::select! {
                Some(mut pointer) = root_rx.recv() => {
                    while let Ok(newer) = root_rx.try_recv() {
                        pointer = newer;
                    }
                    if current.as_ref() == Some(&pointer) {
                        continue;
                    }
                    if let Some(stale) = child.take() {
                        stale.unsubscribe();
                    }
                    generation += 1;
                    debug!(?pointer, generation, "Derived pointer changed");
                    current = Some(pointer.clone());

                    match pointer {
                        None => {
                            if !sink.send(None) {
                                break;
                            }
                        }
                        Some(key) => {
                            let tx = value_tx.clone();
                            let tag = generation;
                            child = Some(downstream(&key).subscribe(move |value| {
                                let _ = tx.send((tag, value));
                            }));
                        }
                    }
                }
                Some((tag, value)) = value_rx.recv() => {
                    if tag != generation {
                        continue;
                    }
                    if !sink.send(Some(value)) {
                        break;
                    }
                }
                else => break,
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::watch;

    use super::*;
    use crate::store::{Address, MemoryBackend, StoreOp, StoreRef, StoreRegistry, Value};
    use crate::track::test_support::{recorder, settle};

    fn text_of(snapshot: &Option<Arc<crate::store::Snapshot>>) -> Option<String> {
        snapshot
            .as_ref()?
            .data
            .get("title")?
            .as_text()
            .map(str::to_string)
    }

    #[tokio::test]
    async fn test_none_while_pointer_unset() {
        let (_tx, rx) = watch::channel::<Option<u32>>(None);
        let (seen, deliver) = recorder();
        let _sub = track_derived_address(
            Track::from_watch(rx),
            |k: &u32| Track::constant(*k * 2),
            deliver,
        );
        settle().await;
        assert_eq!(*seen.lock(), vec![None]);
    }

    #[tokio::test]
    async fn test_follows_pointer_and_releases_stale_downstream() {
        let backend = MemoryBackend::new();
        let registry = StoreRegistry::new(Arc::new(backend.clone()));
        let first = StoreRef::key_value(Address::from_content(b"first"));
        let second = StoreRef::key_value(Address::from_content(b"second"));
        backend
            .write(first.address, first.shape, StoreOp::put("title", "one"))
            .unwrap();
        backend
            .write(second.address, second.shape, StoreOp::put("title", "two"))
            .unwrap();

        let (tx, rx) = watch::channel(Some(first));
        let (seen, deliver) = recorder();
        let reg = registry.clone();
        let sub = track_derived_address(
            Track::from_watch(rx),
            move |target: &StoreRef| Track::store(&reg, *target),
            deliver,
        );
        settle().await;
        assert!(registry.is_open(&first.address));

        tx.send(Some(second)).unwrap();
        settle().await;
        assert!(!registry.is_open(&first.address));
        assert!(registry.is_open(&second.address));

        // Writes to the stale target are not delivered
        backend
            .write(first.address, first.shape, StoreOp::put("title", "stale"))
            .unwrap();
        settle().await;

        let titles: Vec<_> = seen
            .lock()
            .iter()
            .map(|v: &Option<Option<Arc<crate::store::Snapshot>>>| v.as_ref().and_then(text_of))
            .collect();
        assert_eq!(titles, vec![Some("one".into()), Some("two".into())]);

        sub.unsubscribe();
        settle().await;
        assert_eq!(registry.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unsetting_pointer_delivers_none() {
        let (tx, rx) = watch::channel(Some(1u32));
        let (seen, deliver) = recorder();
        let _sub = track_derived_address(
            Track::from_watch(rx),
            |k: &u32| Track::constant(Value::Number(*k as f64)),
            deliver,
        );
        settle().await;
        tx.send(None).unwrap();
        settle().await;
        assert_eq!(*seen.lock(), vec![Some(Value::Number(1.0)), None]);
    }
}
