//! Generic keyed cache for deduplicating loaded resources
//!
//! Values are constructed lazily by a caller-supplied loader and shared as
//! `Arc<V>`. Every key owns its own load slot: concurrent `get_or_load` calls
//! for the same missing key run the loader once, the others wait on the slot
//! and receive the same `Arc`. Loads for different keys never block each other.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Per-key slot, filled by the first successful load
type Slot<V> = Arc<Mutex<Option<Arc<V>>>>;

/// Thread-safe map from key to lazily constructed, reference-counted value
pub struct KeyedCache<K, V> {
    slots: RwLock<HashMap<K, Slot<V>>>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a new empty cache
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, running `load` if it is missing
    ///
    /// A failing loader leaves the key empty so a later call can retry.
    ///
    /// # Arguments
    /// * `key` - Cache key
    /// * `load` - Constructor run at most once per successful fill
    ///
    /// # Returns
    /// A shared reference to the cached value
    pub fn get_or_load<E, F>(&self, key: &K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = guard.as_ref() {
            return Ok(Arc::clone(value));
        }

        let value = Arc::new(load(key)?);
        *guard = Some(Arc::clone(&value));
        Ok(value)
    }

    /// Get a cached value without loading
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slot = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.get(key)?)
        };
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    /// Drop the cached value for `key`
    ///
    /// Holders of the previous `Arc` keep it alive; the next `get_or_load`
    /// loads a fresh value. Returns the evicted value, if any.
    pub fn invalidate(&self, key: &K) -> Option<Arc<V>> {
        let slot = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)?;
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.take()
    }

    /// Drop every cached value
    pub fn clear(&self) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of keys holding a loaded value
    pub fn len(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
            })
            .count()
    }

    /// Whether no value is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every loaded value
    pub fn values(&self) -> Vec<Arc<V>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter_map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }

    fn slot(&self, key: &K) -> Slot<V> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_cache_creation() {
        let cache: KeyedCache<String, u32> = KeyedCache::new();
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
        assert!(cache.get(&"missing".to_string()).is_none());
    }

    #[test]
    fn test_get_or_load_deduplicates() {
        let cache: KeyedCache<&str, String> = KeyedCache::new();
        let loads = AtomicUsize::new(0);

        let load = |key: &&str| -> Result<String, ()> {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(format!("value for {key}"))
        };

        let first = cache.get_or_load(&"a", load).unwrap();
        let second = cache
            .get_or_load(&"a", |_| -> Result<String, ()> { panic!("must not reload") })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let cache: KeyedCache<u32, u32> = KeyedCache::new();

        let err = cache.get_or_load(&7, |_| Err::<u32, _>("boom"));
        assert_eq!(err.unwrap_err(), "boom");
        assert!(cache.is_empty());

        let value = cache.get_or_load(&7, |k| Ok::<_, &str>(k * 2)).unwrap();
        assert_eq!(*value, 14);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache: KeyedCache<u32, u32> = KeyedCache::new();
        let old = cache.get_or_load(&1, |_| Ok::<_, ()>(10)).unwrap();
        cache.get_or_load(&2, |_| Ok::<_, ()>(20)).unwrap();

        let evicted = cache.invalidate(&1).unwrap();
        assert!(Arc::ptr_eq(&old, &evicted));
        assert!(cache.get(&1).is_none());
        assert_eq!(*old, 10);

        let fresh = cache.get_or_load(&1, |_| Ok::<_, ()>(11)).unwrap();
        assert_eq!(*fresh, 11);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&2).is_none());
    }

    #[test]
    fn test_concurrent_loads_run_once() {
        let cache: Arc<KeyedCache<u32, u64>> = Arc::new(KeyedCache::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_load(&42, |_| {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(10));
                            Ok::<_, ()>(4242)
                        })
                        .unwrap()
                })
            })
            .collect();

        let values: Vec<Arc<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }
}
