//! List+watch pipelines, one per kind.
//!
//! Events flow: convert to the canonical record, filter, diff against the
//! cache, store, enqueue. The initial list arrives as a sequence of
//! `InitApply` events and is treated as ADDs; a watch re-initialization
//! replays the world the same way, and the diff collapses unchanged
//! records into no-ops. Updates are enqueued only when the canonical
//! post-image differs from the pre-image, which also excludes the volatile
//! fields (resource version, conditions, ...) that the records do not
//! carry.

use futures::{StreamExt, TryStreamExt};
use kube::api::Api;
use kube::runtime::watcher;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::keys::ObjectKey;
use crate::queue::WorkQueue;
use crate::resources::FromKube;
use crate::store::Store;

/// Objects in namespaces reserved for the control plane are never load
/// balanced.
pub const SYSTEM_NAMESPACE_PREFIX: &str = "kube-";

pub fn drop_system_namespaces(key: &ObjectKey) -> bool {
    key.namespace.starts_with(SYSTEM_NAMESPACE_PREFIX)
}

pub fn drop_none(_: &ObjectKey) -> bool {
    false
}

pub struct Informer<K, R: FromKube<K>> {
    store: Store<R>,
    queue: Arc<WorkQueue>,
    drop_key: fn(&ObjectKey) -> bool,
    init_seen: Option<BTreeSet<ObjectKey>>,
    _kube: PhantomData<fn(K)>,
}

impl<K, R> Informer<K, R>
where
    R: FromKube<K> + Clone + PartialEq,
{
    pub fn new(store: Store<R>, queue: Arc<WorkQueue>, drop_key: fn(&ObjectKey) -> bool) -> Self {
        Self {
            store,
            queue,
            drop_key,
            init_seen: None,
            _kube: PhantomData,
        }
    }

    pub fn ingest(&mut self, event: watcher::Event<K>) {
        use watcher::Event::*;
        match event {
            Init => self.init_seen = Some(BTreeSet::new()),
            InitApply(obj) => {
                if let Some(key) = self.upsert(&obj) {
                    if let Some(seen) = self.init_seen.as_mut() {
                        seen.insert(key);
                    }
                }
            }
            InitDone => {
                self.finish_init();
                self.store.set_ready();
            }
            Apply(obj) => {
                self.upsert(&obj);
            }
            Delete(obj) => match R::key_of(&obj) {
                Err(e) => debug!("dropping deleted object: {e}"),
                Ok(key) => {
                    if !(self.drop_key)(&key) && self.store.delete(&key).is_some() {
                        self.queue.add(key);
                    }
                }
            },
        }
    }

    fn upsert(&mut self, obj: &K) -> Option<ObjectKey> {
        let key = match R::key_of(obj) {
            Ok(key) => key,
            Err(e) => {
                debug!("dropping object without identity: {e}");
                return None;
            }
        };
        if (self.drop_key)(&key) {
            return None;
        }
        let value = match R::from_kube(obj) {
            Ok(value) => value,
            Err(e) => {
                warn!("{key}: dropping malformed object: {e}");
                return None;
            }
        };

        let prev = self.store.apply(key.clone(), value.clone());
        if prev.as_ref() != Some(&value) {
            self.queue.add(key.clone());
        }
        Some(key)
    }

    /// Objects present before a (re)list but absent from it were deleted
    /// while we were not watching.
    fn finish_init(&mut self) {
        let Some(seen) = self.init_seen.take() else {
            return;
        };
        for key in self.store.keys() {
            if !seen.contains(&key) {
                debug!("{key}: gone after relist");
                self.store.delete(&key);
                self.queue.add(key);
            }
        }
    }
}

/// Runs the watch until shutdown, feeding every event through the informer.
/// Watch errors are logged and retried; the kube watcher re-lists with
/// resume tokens on reconnection.
pub async fn run<K, R>(mut informer: Informer<K, R>, api: Api<K>) -> eyre::Result<()>
where
    K: kube::api::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
    R: FromKube<K> + Clone + PartialEq,
{
    let resource = api.resource_url().to_string();
    info!("starting watch on {resource}");

    let mut stream = watcher(api, watcher::Config::default()).boxed();

    loop {
        let event = match stream.try_next().await {
            Ok(v) => v,
            Err(e) => {
                warn!("watch error: {resource}: {e}");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        let Some(event) = event else {
            info!("watch on {resource} stopped");
            return Ok(());
        };

        informer.ingest(event);
    }
}
