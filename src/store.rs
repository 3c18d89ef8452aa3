//! Shared indexed caches fed by the informers.
//!
//! One store exists per watched kind, keyed by [`ObjectKey`]. The informer
//! task is the only writer; reconcile functions read back current records
//! under the store's own lock, without touching the configurator lock.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::keys::ObjectKey;

pub struct Store<T> {
    inner: Arc<RwLock<Inner<T>>>,
}

struct Inner<T> {
    map: BTreeMap<ObjectKey, T>,
    ready: bool,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Store<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                map: BTreeMap::new(),
                ready: false,
            })),
        }
    }

    /// True once the initial list has been fully applied.
    pub fn is_ready(&self) -> bool {
        self.inner.read().unwrap().ready
    }

    pub fn set_ready(&self) {
        self.inner.write().unwrap().ready = true;
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.inner.read().unwrap().map.keys().cloned().collect()
    }
}

impl<T: Clone> Store<T> {
    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.inner.read().unwrap().map.get(key).cloned()
    }

    /// Upserts a record, returning the previous one (if any) so the caller
    /// can suppress no-op updates.
    pub fn apply(&self, key: ObjectKey, value: T) -> Option<T> {
        self.inner.write().unwrap().map.insert(key, value)
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<T> {
        self.inner.write().unwrap().map.remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_returns_previous() {
        let store = Store::new();
        let key = ObjectKey::new("ns", "a");

        assert_eq!(store.apply(key.clone(), 1), None);
        assert_eq!(store.apply(key.clone(), 2), Some(1));
        assert_eq!(store.get(&key), Some(2));
        assert_eq!(store.delete(&key), Some(2));
        assert_eq!(store.get(&key), None);
    }

    #[test]
    fn test_readiness() {
        let store = Store::<u8>::new();
        assert!(!store.is_ready());
        store.set_ready();
        assert!(store.is_ready());
    }
}
