//! Provides the pluggable key→value store a cache operates on.
//!
//! A [Cache](crate::cache::Cache) never touches entries directly - every read
//! and write goes through the [KeyValueStore](KeyValueStore) contract. Two
//! implementations ship with this crate:
//!
//! * [InMemoryStore](InMemoryStore) keeps entries in a concurrent map within
//!   the process and is authoritative over all timestamps. This is the
//!   default store.
//! * [RemoteStore](RemoteStore) delegates to a Redis keyspace. Expiry is
//!   deferred to Redis and timestamps are reconstructed on a best-effort
//!   basis.
//!
//! Store implementations never surface backend failures to the caller: a
//! failed read is a miss, a failed write is a rejection
//! ([StoreWrite::entry](StoreWrite::entry) being `None`). The coordinator
//! treats a rejected write as a cache which is temporarily unable to retain
//! the value - the loaded value itself is still handed to the caller.
pub mod memory;
pub mod remote;

pub use memory::InMemoryStore;
pub use remote::{RemoteKey, RemoteStore};

use crate::entry::{CacheEntry, Instant};

use async_trait::async_trait;

/// Callback invoked for every entry a store removes.
///
/// Supplied by the coordinator so that the sweep, direct invalidation,
/// replacement by a reload and shutdown all share a single disposal path.
pub type EvictFn<'a, K, V> = &'a (dyn Fn(&K, CacheEntry<V>) + Send + Sync);

/// Updater applied by [add_or_update](KeyValueStore::add_or_update) when the
/// key already holds a value.
pub type UpdateFn<'a, K, V> = &'a (dyn Fn(&K, &V) -> V + Send + Sync);

/// The result of an [add_or_update](KeyValueStore::add_or_update) call.
#[derive(Debug)]
pub struct StoreWrite<V> {
    /// The entry now present in the store, or `None` if the backend rejected
    /// the write.
    pub entry: Option<CacheEntry<V>>,

    /// The previous entry which was displaced by the write, if any.
    pub replaced: Option<CacheEntry<V>>,
}

/// An abstract map from keys to [cache entries](CacheEntry).
///
/// All operations are safe to invoke from any task. `try_get` observes a
/// consistent entry (value and timestamps always belong together) and
/// [entries](KeyValueStore::entries) yields a weakly-consistent snapshot
/// which may interleave with concurrent writers.
#[async_trait]
pub trait KeyValueStore<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Fetches the entry for the given key, recording the read in the
    /// entry's last-access timestamp.
    async fn try_get(&self, key: &K) -> Option<CacheEntry<V>>;

    /// Inserts a fresh entry for the given key unless one is already
    /// present. Returns **true** if the value was inserted.
    async fn try_add(&self, key: K, value: V) -> bool;

    /// Inserts or replaces the entry for the given key.
    ///
    /// If the key is vacant, a fresh entry for `value` is created. If it is
    /// occupied, `update` computes the replacement from the present value.
    /// Either way the resulting entry carries a restarted freshness clock.
    async fn add_or_update(&self, key: K, value: V, update: UpdateFn<'_, K, V>) -> StoreWrite<V>;

    /// Removes the entry for the given key, returning it if one was present.
    async fn try_remove(&self, key: &K) -> Option<CacheEntry<V>>;

    /// Restarts the freshness clock of the entry for the given key. Returns
    /// **true** if an entry was present.
    async fn reset_expiry(&self, key: &K) -> bool;

    /// Determines if an entry for the given key is present, without
    /// consulting freshness and without recording a read.
    async fn contains(&self, key: &K) -> bool;

    /// Returns a weakly-consistent snapshot of all entries.
    async fn entries(&self) -> Vec<(K, CacheEntry<V>)>;

    /// Performs the eviction sweep.
    ///
    /// First removes all entries loaded before `cutoff` (`None` meaning that
    /// no entry can be stale), then trims the surviving population down to
    /// `max_size` entries, discarding the oldest loads first with ties broken
    /// by the oldest read. Every removed entry is passed to `on_evict`.
    /// Returns the number of surviving entries.
    ///
    /// Stores which defer expiry to a remote system implement this as a
    /// no-op which merely reports the current population.
    async fn flush_invalidated(
        &self,
        max_size: usize,
        cutoff: Option<Instant>,
        on_evict: EvictFn<'_, K, V>,
    ) -> usize;

    /// Removes all entries, passing each to `on_evict`.
    async fn invalidate_all(&self, on_evict: EvictFn<'_, K, V>);

    /// Determines if the backing system is authoritative over expiry.
    ///
    /// When this returns **true**, the coordinator's sweep degrades to a
    /// no-op and the size indicator is not enforced.
    fn owns_expiry(&self) -> bool {
        false
    }
}
