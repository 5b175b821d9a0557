//! Provides the default, in-process implementation of the store contract.
//!
//! Entries live in a concurrent hash map, so all operations are safe from
//! any task without an external lock. The store is authoritative over the
//! per-entry timestamps: reads update the last-access instant, writes restart
//! the freshness clock and the sweep compares the load instants against the
//! cutoff handed in by the coordinator.
use std::hash::Hash;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::entry::{CacheEntry, Instant};
use crate::store::{EvictFn, KeyValueStore, StoreWrite, UpdateFn};

/// A store backed by a concurrent hash map.
///
/// This is the store a [Cache](crate::cache::Cache) uses unless another one
/// is supplied to its builder.
///
/// # Example
/// ```
/// # use recache::store::{InMemoryStore, KeyValueStore};
/// #[tokio::main]
/// async fn main() {
///     let store = InMemoryStore::new();
///
///     assert_eq!(store.try_add(1, "one".to_owned()).await, true);
///     assert_eq!(store.try_add(1, "uno".to_owned()).await, false);
///
///     let entry = store.try_get(&1).await.unwrap();
///     assert_eq!(entry.value(), "one");
/// }
/// ```
pub struct InMemoryStore<K, V> {
    map: DashMap<K, CacheEntry<V>>,
}

impl<K, V> InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    /// Creates an empty store.
    pub fn new() -> Self {
        InMemoryStore {
            map: DashMap::new(),
        }
    }
}

impl<K, V> Default for InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        InMemoryStore::new()
    }
}

#[async_trait]
impl<K, V> KeyValueStore<K, V> for InMemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn try_get(&self, key: &K) -> Option<CacheEntry<V>> {
        let mut entry = self.map.get_mut(key)?;
        entry.touch();

        Some(entry.clone())
    }

    async fn try_add(&self, key: K, value: V) -> bool {
        match self.map.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let _ = slot.insert(CacheEntry::new(value));
                true
            }
        }
    }

    /// Atomic per key: the updater runs under the internal lock of the key's
    /// map shard, so it must be quick and must not access the store itself.
    async fn add_or_update(&self, key: K, value: V, update: UpdateFn<'_, K, V>) -> StoreWrite<V> {
        match self.map.entry(key) {
            Entry::Occupied(mut slot) => {
                let updated = update(slot.key(), slot.get().value());
                let replaced = slot.insert(CacheEntry::new(updated));

                StoreWrite {
                    entry: Some(slot.get().clone()),
                    replaced: Some(replaced),
                }
            }
            Entry::Vacant(slot) => StoreWrite {
                entry: Some(slot.insert(CacheEntry::new(value)).clone()),
                replaced: None,
            },
        }
    }

    async fn try_remove(&self, key: &K) -> Option<CacheEntry<V>> {
        self.map.remove(key).map(|(_, entry)| entry)
    }

    async fn reset_expiry(&self, key: &K) -> bool {
        match self.map.get_mut(key) {
            Some(mut entry) => {
                entry.reset_expiry();
                true
            }
            None => false,
        }
    }

    async fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    async fn entries(&self) -> Vec<(K, CacheEntry<V>)> {
        self.map
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect()
    }

    async fn flush_invalidated(
        &self,
        max_size: usize,
        cutoff: Option<Instant>,
        on_evict: EvictFn<'_, K, V>,
    ) -> usize {
        // Phase one: walk the map once and partition into stale entries and
        // survivors. The snapshot is weakly consistent, therefore each
        // removal re-checks the staleness predicate - an entry which was
        // reloaded in the meantime stays and counts as a survivor.
        let mut stale = Vec::new();
        let mut surviving = Vec::new();
        for item in self.map.iter() {
            match cutoff {
                Some(cutoff) if item.value().time_loaded() < cutoff => {
                    stale.push(item.key().clone());
                }
                _ => surviving.push((
                    item.key().clone(),
                    item.value().time_loaded(),
                    item.value().time_last_accessed(),
                )),
            }
        }

        for key in stale {
            let removed = match cutoff {
                Some(cutoff) => self
                    .map
                    .remove_if(&key, |_, entry| entry.time_loaded() < cutoff),
                None => None,
            };

            match removed {
                Some((key, entry)) => on_evict(&key, entry),
                None => {
                    if let Some(entry) = self.map.get(&key) {
                        surviving.push((
                            key.clone(),
                            entry.time_loaded(),
                            entry.time_last_accessed(),
                        ));
                    }
                }
            }
        }

        // Phase two: trim the survivors down to the size indicator. Oldest
        // load goes first, ties are broken by the oldest read - a cheap
        // approximation of LRU which requires no global lock.
        if surviving.len() > max_size {
            let over = surviving.len() - max_size;
            surviving.sort_unstable_by_key(|(_, loaded, accessed)| (*loaded, *accessed));

            for (key, ..) in surviving.drain(..over) {
                if let Some((key, entry)) = self.map.remove(&key) {
                    on_evict(&key, entry);
                }
            }
        }

        surviving.len()
    }

    async fn invalidate_all(&self, on_evict: EvictFn<'_, K, V>) {
        let keys: Vec<K> = self.map.iter().map(|item| item.key().clone()).collect();

        for key in keys {
            if let Some((key, entry)) = self.map.remove(&key) {
                on_evict(&key, entry);
            }
        }
    }
}
