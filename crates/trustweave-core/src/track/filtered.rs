//! Live filter over a changing list

use super::{track_dynamic_set, DynamicBranch, DynamicSetOptions, Subscription, Track};

/// Track the elements of a list that currently satisfy a condition
///
/// Each distinct element gets one condition tracker. The delivered list keeps
/// root order and only contains elements whose condition is currently `true`;
/// elements whose condition has not reported yet are left out.
pub fn track_filtered_set<B>(
    root: Track<Vec<B>>,
    condition: impl Fn(&B) -> Track<bool> + Send + Sync + 'static,
    deliver: impl FnMut(Vec<B>) + Send + 'static,
) -> Subscription
where
    B: DynamicBranch,
{
    track_dynamic_set(
        root,
        DynamicSetOptions::default(),
        condition,
        |values: Vec<(B, bool)>| {
            values
                .into_iter()
                .filter_map(|(item, keep)| keep.then_some(item))
                .collect()
        },
        deliver,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::watch;

    use super::*;
    use crate::store::{Address, MemoryBackend, StoreOp, StoreRef, StoreRegistry};
    use crate::track::test_support::{recorder, settle};

    #[tokio::test]
    async fn test_filters_live() {
        let backend = MemoryBackend::new();
        let registry = StoreRegistry::new(Arc::new(backend.clone()));
        let stores: Vec<StoreRef> = ["x", "y", "z"]
            .iter()
            .map(|n| StoreRef::key_value(Address::from_content(n.as_bytes())))
            .collect();
        for (i, store) in stores.iter().enumerate() {
            backend
                .write(store.address, store.shape, StoreOp::put("visible", i != 1))
                .unwrap();
        }

        let (_tx, rx) = watch::channel(stores.clone());
        let (seen, deliver) = recorder();
        let reg = registry.clone();
        let _sub = track_filtered_set(
            Track::from_watch(rx),
            move |store: &StoreRef| {
                Track::store(&reg, *store).map(|snapshot| {
                    snapshot
                        .and_then(|s| s.data.get("visible").and_then(|v| v.as_bool()))
                        .unwrap_or(false)
                })
            },
            deliver,
        );
        settle().await;
        assert_eq!(seen.lock().last().unwrap(), &vec![stores[0], stores[2]]);

        backend
            .write(stores[1].address, stores[1].shape, StoreOp::put("visible", true))
            .unwrap();
        backend
            .write(stores[0].address, stores[0].shape, StoreOp::put("visible", false))
            .unwrap();
        settle().await;
        assert_eq!(seen.lock().last().unwrap(), &vec![stores[1], stores[2]]);
    }
}
