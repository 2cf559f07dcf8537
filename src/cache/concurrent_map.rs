//! Concurrent Map Module
//!
//! A thread-safe associative container guarded by a single per-instance lock.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

// == Concurrent Map ==
/// HashMap behind one mutex. Every call is atomic with respect to every other
/// call on the same instance; no ordering is promised across instances.
///
/// Values are never handed out by reference, so no caller can hold the lock
/// beyond the call that took it.
#[derive(Debug)]
pub struct ConcurrentMap<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> ConcurrentMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panic in another holder leaves the map structurally valid, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // == Get ==
    /// Returns a copy of the value stored under `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.lock().get(key).cloned()
    }

    // == Set ==
    /// Stores `value` under `key`, returning the value it replaced.
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.lock().insert(key, value)
    }

    // == Remove ==
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().remove(key)
    }

    /// Removes the value under `key` only if `predicate` holds for it.
    pub fn remove_if<Q>(&self, key: &Q, predicate: impl FnOnce(&V) -> bool) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut map = self.lock();
        if predicate(map.get(key)?) {
            map.remove(key)
        } else {
            None
        }
    }

    /// Stores `value` only when `key` is vacant. Returns false if it was occupied.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut map = self.lock();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, value);
        true
    }

    // == Snapshot ==
    /// Copies every pair out under the lock. Later writes do not affect the result.
    pub fn snapshot(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Removes and returns every pair.
    pub fn drain(&self) -> Vec<(K, V)> {
        self.lock().drain().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> IntoIterator for &ConcurrentMap<K, V> {
    type Item = (K, V);
    type IntoIter = std::vec::IntoIter<(K, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshot().into_iter()
    }
}
