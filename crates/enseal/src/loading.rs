//! A map of asynchronously loaded values where concurrent misses for
//! one key coalesce onto a single in-flight load.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

/// A cloneable wrapper so load errors can be shared between waiters.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl From<anyhow::Error> for SharedError {
    fn from(error: anyhow::Error) -> Self {
        SharedError(Arc::new(error))
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl SharedError {
    /// Recover a typed error from the shared chain, if it is one.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

type SharedLoad<V> = Shared<BoxFuture<'static, Result<V, SharedError>>>;

struct Entry<V: Clone> {
    generation: u64,
    load: SharedLoad<V>,
}

/// Keyed, coalescing async cache.
///
/// Invalidation is by (key, generation) so that a reader invalidating a
/// context it observed as unusable can never evict a successor entry
/// another reader already installed. Pending waiters of a removed entry
/// keep their shared future; no new waiters attach to it.
pub(crate) struct LoadingMap<K, V: Clone> {
    store: std::sync::Mutex<HashMap<K, Entry<V>>>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl<K, V> LoadingMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        LoadingMap {
            store: std::sync::Mutex::new(HashMap::new()),
            next_generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Return the current load for `key`, starting `load` if there is
    /// none. The returned generation names the entry for invalidation.
    pub fn get_or_load<F, Fut>(&self, key: &K, load: F) -> (u64, SharedLoad<V>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let mut store = self.store.lock().unwrap();

        if let Some(entry) = store.get(key) {
            return (entry.generation, entry.load.clone());
        }

        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let shared = load()
            .map(|result| result.map_err(SharedError::from))
            .boxed()
            .shared();

        store.insert(
            key.clone(),
            Entry {
                generation,
                load: shared.clone(),
            },
        );
        (generation, shared)
    }

    /// Remove the entry for `key` if it is still the one named by
    /// `generation`.
    pub fn invalidate(&self, key: &K, generation: u64) {
        let mut store = self.store.lock().unwrap();
        if store
            .get(key)
            .map_or(false, |entry| entry.generation == generation)
        {
            store.remove(key);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }
}
