use std::fmt::Display;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{event, Level};

/// A cache that lives for the duration of a run. Values are computed at most once per key: while
/// one task fills in a key, other tasks asking for it wait instead of doing the same work again.
pub struct GenericCache<TKey, TValue> {
    cached_data: DashMap<TKey, Arc<TValue>>,
    active_writes: DashMap<TKey, Arc<RwLock<()>>>,
}

impl<TKey: Hash + Eq + Display + Clone, TValue> GenericCache<TKey, TValue> {
    /// Creates an empty `GenericCache`
    pub fn new() -> GenericCache<TKey, TValue> {
        GenericCache {
            cached_data: DashMap::new(),
            active_writes: DashMap::new(),
        }
    }

    /// Gets the cached data if available, waiting for it if there is an active writer. If the data
    /// is not available and no other task is busy writing it, returns not found together with the
    /// guard that must be handed to [`GenericCache::set`].
    pub async fn get_cached(&self, key: &TKey) -> GetCachedResult<TValue> {
        loop {
            if let Some(value) = self.cached_data.get(key) {
                event!(Level::TRACE, "Cache hit: {key}");
                return GetCachedResult::Found(value.value().clone());
            }

            let lock = match self.active_writes.entry(key.clone()) {
                Entry::Occupied(e) => e.get().clone(),
                Entry::Vacant(e) => {
                    let lock = Arc::new(RwLock::new(()));
                    let write_guard = lock.clone().write_owned().await;
                    e.insert(lock);
                    return GetCachedResult::NotFound(write_guard);
                }
            };

            // Another task is filling in this key. The shard lock of the map is released at this
            // point, so the writer can finish while we wait.
            event!(Level::TRACE, "Waiting for another task to populate {key}");
            let _ = lock.read().await;

            // A writer that failed leaves nothing behind, in which case we take over
            if !self.cached_data.contains_key(key) {
                self.active_writes
                    .remove_if(key, |_, active| Arc::ptr_eq(active, &lock));
            }
        }
    }

    /// Caches the value at the given key and wakes up everyone waiting for it
    pub fn set(&self, key: TKey, value: Arc<TValue>, guard: OwnedRwLockWriteGuard<()>) {
        self.cached_data.insert(key.clone(), value);
        drop(guard);
        self.active_writes.remove(&key);
    }
}

/// Represents the result of a call to [`GenericCache::get_cached`]
pub enum GetCachedResult<T> {
    /// The key was found in the cache and its value is included in the enum variant
    Found(Arc<T>),
    /// The key was not found in the cache and there are no active writes, so the caller is expected
    /// to retrieve the value from somewhere else and write it to the cache by calling
    /// [`GenericCache::set`] with the provided write guard. Dropping the guard without calling
    /// `set` lets the next waiter try instead.
    NotFound(OwnedRwLockWriteGuard<()>),
}
