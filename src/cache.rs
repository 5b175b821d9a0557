//! Provides the cache coordinator.
//!
//! A [Cache](Cache) ties the building blocks of this crate together: it
//! consults the backing [store](crate::store::KeyValueStore) on every read,
//! serializes concurrent loads per key through the gate registry, decides
//! freshness (optionally jittered), runs the periodic sweep and reports what
//! happens through optional callbacks.
//!
//! # The read path
//! [get_or_load](Cache::get_or_load) first performs an optimistic lookup: a
//! fresh entry is returned right away without touching any gate. On a miss
//! the caller acquires the gate of the key, waiting at most the configured
//! circuit breaker timeout - the one caller holding the gate loads, everyone
//! else either waits for that load or fails fast with a
//! [CircuitBreakerTimeout](CircuitBreakerTimeout). Once the gate is held,
//! the store is consulted a second time, as the previous holder usually has
//! completed the load in the meantime.
//!
//! # Example
//! ```
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use recache::cache::Cache;
//! # use recache::options::CacheOptions;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = CacheOptions::new("squares").with_item_expiry(Duration::from_secs(60));
//!     let cache: Arc<Cache<i32, i32>> = Cache::builder(options)
//!         .loader(|key: i32| async move { Ok(key * key) })
//!         .build()?;
//!
//!     assert_eq!(cache.get_or_load(&12, false).await?, 144);
//!
//!     // The loader is bypassed as long as the entry stays fresh...
//!     assert_eq!(cache.get(&12, false).await, Some(144));
//!     assert_eq!(cache.get(&13, false).await, None);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
use std::fmt;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::Notify;

use crate::entry::{CacheEntry, Instant};
use crate::gate::{acquire_gate, GateRegistry};
use crate::options::CacheOptions;
use crate::stats::{CacheStats, StatsCounters};
use crate::store::{InMemoryStore, KeyValueStore};

/// Error reported when a caller gave up waiting on the gate of a key which
/// another caller is currently loading.
///
/// This is carried inside the [anyhow::Error] returned by
/// [get_or_load](Cache::get_or_load) and can be matched via `downcast_ref`.
/// The in-flight load of the other caller is not affected.
#[derive(Debug, Clone)]
pub struct CircuitBreakerTimeout {
    cache: String,
    key: String,
    timeout: Duration,
}

impl CircuitBreakerTimeout {
    /// Returns the name of the cache which reported the timeout.
    pub fn cache_name(&self) -> &str {
        &self.cache
    }

    /// Returns a rendering of the key whose gate could not be acquired.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the configured circuit breaker timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Display for CircuitBreakerTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache {}: failed to acquire the load permit for key {} within {} ms",
            self.cache,
            self.key,
            self.timeout.as_millis()
        )
    }
}

impl std::error::Error for CircuitBreakerTimeout {}

type LoaderFn<K, V> = Arc<dyn Fn(&K) -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;
type HitCallback<K, V> = Box<dyn Fn(&K, &CacheEntry<V>) + Send + Sync>;
type MissCallback<K, V> = Box<dyn Fn(&K, &CacheEntry<V>, u64) + Send + Sync>;
type FlushCallback = Box<dyn Fn(usize, usize, u64) + Send + Sync>;
type EvictCallback<K, V> = Box<dyn Fn(&K, CacheEntry<V>) + Send + Sync>;

struct Callbacks<K, V> {
    hit: Option<HitCallback<K, V>>,
    miss: Option<MissCallback<K, V>>,
    flush: Option<FlushCallback>,
    evict: Option<EvictCallback<K, V>>,
}

impl<K, V> Default for Callbacks<K, V> {
    fn default() -> Self {
        Callbacks {
            hit: None,
            miss: None,
            flush: None,
            evict: None,
        }
    }
}

/// The cache coordinator.
///
/// Built via [Cache::builder](Cache::builder), which validates the options
/// and spawns the background sweep (the builder therefore has to be used
/// within a tokio runtime). The coordinator is shared as an `Arc` and all
/// operations take `&self`, so it can be called from any task.
///
/// Dropping the last `Arc` winds the sweep down on its own; calling
/// [shutdown](Cache::shutdown) additionally evicts all entries right away
/// and drains the key gates.
pub struct Cache<K, V> {
    options: CacheOptions,
    store: Arc<dyn KeyValueStore<K, V>>,
    gates: GateRegistry<K>,
    loader: Option<LoaderFn<K, V>>,
    callbacks: Callbacks<K, V>,
    stats: StatsCounters,
    running: AtomicBool,
    shutdown_signal: Arc<Notify>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a builder for a cache with the given options.
    pub fn builder(options: CacheOptions) -> CacheBuilder<K, V> {
        CacheBuilder {
            options,
            store: None,
            loader: None,
            callbacks: Callbacks::default(),
        }
    }

    /// Returns the cached value for the given key, loading it if required.
    ///
    /// If a fresh entry is present it is returned immediately (optionally
    /// restarting its freshness clock when `reset_expiry_on_hit` is set).
    /// Otherwise the configured default loader is invoked - serialized per
    /// key, so concurrent callers for the same key trigger at most one load.
    ///
    /// # Errors
    /// Fails if no default loader is configured, if the loader itself fails
    /// (the error is passed through verbatim and nothing is cached) or with
    /// a [CircuitBreakerTimeout] if the key gate could not be acquired
    /// within the configured timeout.
    pub async fn get_or_load(&self, key: &K, reset_expiry_on_hit: bool) -> anyhow::Result<V> {
        let loader = match &self.loader {
            Some(loader) => loader.clone(),
            None => anyhow::bail!(
                "Cache {}: no default loader configured - configure one on the builder or use get_or_load_with",
                self.options.name
            ),
        };

        self.get_or_load_with(key, reset_expiry_on_hit, move |key| loader(&key))
            .await
    }

    /// Just like [get_or_load](Cache::get_or_load), but loads via the given
    /// closure instead of the configured default loader.
    pub async fn get_or_load_with<F, Fut>(
        &self,
        key: &K,
        reset_expiry_on_hit: bool,
        loader: F,
    ) -> anyhow::Result<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send,
    {
        self.stats.record_read();

        // Optimistic fast path: no gate is touched as long as the entry is
        // fresh...
        if let Some(value) = self.lookup_fresh(key, reset_expiry_on_hit).await {
            self.stats.record_hit();
            return Ok(value);
        }

        let gate = self.gates.ensure_gate(key);
        let _guard = match acquire_gate(gate, self.options.circuit_breaker_timeout).await {
            Some(guard) => guard,
            None => {
                self.stats.record_circuit_breaker_trip();
                let timeout = self
                    .options
                    .circuit_breaker_timeout
                    .unwrap_or(Duration::ZERO);
                log::debug!(
                    "Cache {}: circuit breaker tripped for key {:?} after {} ms",
                    self.options.name,
                    key,
                    timeout.as_millis()
                );

                return Err(anyhow::Error::new(CircuitBreakerTimeout {
                    cache: self.options.name.clone(),
                    key: format!("{:?}", key),
                    timeout,
                }));
            }
        };

        // While we waited on the gate, its previous holder usually completed
        // the load - check again before doing any work ourselves.
        if let Some(value) = self.lookup_fresh(key, reset_expiry_on_hit).await {
            self.stats.record_hit();
            return Ok(value);
        }

        self.stats.record_miss();
        let started = Instant::now();
        let value = match loader(key.clone()).await {
            Ok(value) => value,
            Err(error) => {
                self.stats.record_load_failure();
                log::debug!(
                    "Cache {}: loading key {:?} failed: {}",
                    self.options.name,
                    key,
                    error
                );
                return Err(error);
            }
        };
        self.stats.record_load();

        let write = self
            .store
            .add_or_update(key.clone(), value.clone(), &|_, _| value.clone())
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &write.entry {
            Some(entry) => self.fire_miss(key, entry, elapsed_ms),
            None => {
                // A transient store failure must not look like a loader
                // failure - the caller still receives the loaded value.
                log::warn!(
                    "Cache {}: the backing store rejected the write for key {:?}",
                    self.options.name,
                    key
                );
                self.fire_miss(key, &CacheEntry::new(value.clone()), elapsed_ms);
            }
        }

        if let Some(replaced) = write.replaced {
            self.stats.record_evictions(1);
            self.fire_evict(key, replaced);
        }

        Ok(value)
    }

    /// Returns the cached value for the given key if a fresh one is present.
    ///
    /// This never invokes a loader. An expired entry is not returned, but
    /// also not removed - that is the job of the sweep.
    pub async fn get(&self, key: &K, reset_expiry_on_hit: bool) -> Option<V> {
        self.stats.record_read();

        match self.lookup_fresh(key, reset_expiry_on_hit).await {
            Some(value) => {
                self.stats.record_hit();
                Some(value)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Inserts a value for the given key unless one is already present.
    /// Returns **true** if the value was inserted.
    pub async fn try_add(&self, key: K, value: V) -> bool {
        self.stats.record_write();
        self.store.try_add(key, value).await
    }

    /// Removes the entry for the given key. Returns **true** if an entry was
    /// removed.
    pub async fn invalidate(&self, key: &K) -> bool {
        match self.store.try_remove(key).await {
            Some(entry) => {
                self.stats.record_evictions(1);
                self.fire_evict(key, entry);
                self.gates.remove_idle_gate(key);
                true
            }
            None => false,
        }
    }

    /// Removes all entries.
    pub async fn invalidate_all(&self) {
        let evicted = AtomicU64::new(0);
        self.store
            .invalidate_all(&|key, entry| {
                let _ = evicted.fetch_add(1, Ordering::Relaxed);
                self.fire_evict(key, entry);
            })
            .await;

        self.stats.record_evictions(evicted.into_inner());
    }

    /// Determines if an entry for the given key is present, fresh or not.
    pub async fn contains_key(&self, key: &K) -> bool {
        self.store.contains(key).await
    }

    /// Returns the number of entries currently in the store, including ones
    /// which are expired but not yet swept.
    pub async fn len(&self) -> usize {
        self.store.entries().await.len()
    }

    /// Determines if the cache holds no entries at all.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns a weakly-consistent snapshot of all entries.
    pub async fn entries(&self) -> Vec<(K, CacheEntry<V>)> {
        self.store.entries().await
    }

    /// Runs the eviction sweep right now.
    ///
    /// Expired entries (no jitter is applied here - the sweep is eventually
    /// consistent, jitter is a read path concern) are removed and the
    /// remaining population is trimmed down to the size indicator. The flush
    /// callback is invoked with the remaining count, the flushed count and
    /// the elapsed milliseconds.
    pub async fn flush_invalidated_entries(&self) {
        let started = Instant::now();
        let cutoff = Instant::now().checked_sub(self.options.item_expiry);

        let flushed = AtomicU64::new(0);
        let remaining = self
            .store
            .flush_invalidated(self.options.max_size_indicator, cutoff, &|key, entry| {
                let _ = flushed.fetch_add(1, Ordering::Relaxed);
                self.fire_evict(key, entry);
            })
            .await;
        let flushed = flushed.into_inner();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        self.stats.record_flush();
        self.stats.record_evictions(flushed);
        if flushed > 0 {
            log::debug!(
                "Cache {}: flushed {} entries, {} remaining - took {} ms",
                self.options.name,
                flushed,
                remaining,
                elapsed_ms
            );
        }

        self.fire_flush(remaining, flushed as usize, elapsed_ms);
    }

    /// Returns a snapshot of the runtime metrics of this cache.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Returns the options this cache was built with.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Returns the name of this cache.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Determines if this cache is still operational or has been shut down.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shuts this cache down.
    ///
    /// Stops the background sweep, removes all entries (notifying the evict
    /// callback) and drains the key gate registry. Subsequent operations
    /// still work against the (now empty) store, but no sweep will run
    /// anymore.
    pub async fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown_signal.notify_waiters();
            self.invalidate_all().await;
            self.gates.drain();

            log::info!("Cache {}: shut down", self.options.name);
        }
    }

    pub(crate) fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    /// Computes the expiry to apply for a single freshness decision.
    ///
    /// Without jitter this is simply the configured item expiry. With a
    /// jitter window `W` the result is drawn uniformly from
    /// `item_expiry - W/2` up to (excluding) `item_expiry + W/2`, so that
    /// entries loaded at the same time do not all expire at the same time.
    pub(crate) fn effective_expiry(&self) -> Duration {
        let window = self.options.jitter_window();
        if window.is_zero() {
            return self.options.item_expiry;
        }

        let window_ms = (window.as_millis() as u64).max(1);
        let jitter = rand::thread_rng().gen_range(0..window_ms);

        self.options.item_expiry - window / 2 + Duration::from_millis(jitter)
    }

    async fn lookup_fresh(&self, key: &K, reset_expiry_on_hit: bool) -> Option<V> {
        let entry = self.store.try_get(key).await?;
        if !entry.is_fresh(self.effective_expiry()) {
            return None;
        }

        if reset_expiry_on_hit {
            let _ = self.store.reset_expiry(key).await;
        }

        self.fire_hit(key, &entry);
        Some(entry.into_value())
    }

    fn fire_hit(&self, key: &K, entry: &CacheEntry<V>) {
        if let Some(callback) = &self.callbacks.hit {
            if catch_unwind(AssertUnwindSafe(|| callback(key, entry))).is_err() {
                log::warn!("Cache {}: a hit callback panicked", self.options.name);
            }
        }
    }

    fn fire_miss(&self, key: &K, entry: &CacheEntry<V>, elapsed_ms: u64) {
        if let Some(callback) = &self.callbacks.miss {
            if catch_unwind(AssertUnwindSafe(|| callback(key, entry, elapsed_ms))).is_err() {
                log::warn!("Cache {}: a miss callback panicked", self.options.name);
            }
        }
    }

    fn fire_flush(&self, remaining: usize, flushed: usize, elapsed_ms: u64) {
        if let Some(callback) = &self.callbacks.flush {
            if catch_unwind(AssertUnwindSafe(|| callback(remaining, flushed, elapsed_ms))).is_err()
            {
                log::warn!("Cache {}: a flush callback panicked", self.options.name);
            }
        }
    }

    fn fire_evict(&self, key: &K, entry: CacheEntry<V>) {
        if let Some(callback) = &self.callbacks.evict {
            if catch_unwind(AssertUnwindSafe(|| callback(key, entry))).is_err() {
                log::warn!("Cache {}: an evict callback panicked", self.options.name);
            }
        }
    }

    /// Spawns the periodic sweep.
    ///
    /// The task only holds a weak reference: once the last user drops the
    /// cache, the loop winds down by itself at the next tick. A shutdown
    /// stops it right away. As the next tick is only scheduled after a sweep
    /// has completed, sweeps never overlap.
    fn spawn_sweep(cache: Weak<Cache<K, V>>, flush_interval: Duration, shutdown: Arc<Notify>) {
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(flush_interval) => (),
                    _ = shutdown.notified() => break,
                }

                match cache.upgrade() {
                    Some(cache) if cache.is_running() => cache.flush_invalidated_entries().await,
                    _ => break,
                }
            }
        }));
    }
}

/// Assembles a [Cache](Cache).
///
/// Obtained via [Cache::builder](Cache::builder). The store defaults to a
/// fresh [InMemoryStore](crate::store::InMemoryStore); the loader and all
/// callbacks are optional.
pub struct CacheBuilder<K, V> {
    options: CacheOptions,
    store: Option<Arc<dyn KeyValueStore<K, V>>>,
    loader: Option<LoaderFn<K, V>>,
    callbacks: Callbacks<K, V>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Specifies the backing store.
    pub fn store(mut self, store: Arc<dyn KeyValueStore<K, V>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Specifies the default loader invoked by
    /// [get_or_load](Cache::get_or_load).
    pub fn loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.loader = Some(Arc::new(
            move |key: &K| -> BoxFuture<'static, anyhow::Result<V>> {
                Box::pin(loader(key.clone()))
            },
        ));
        self
    }

    /// Installs a callback which is notified for every read served by a
    /// fresh entry.
    pub fn on_hit<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &CacheEntry<V>) + Send + Sync + 'static,
    {
        self.callbacks.hit = Some(Box::new(callback));
        self
    }

    /// Installs a callback which is notified for every completed load along
    /// with the elapsed milliseconds.
    pub fn on_miss<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &CacheEntry<V>, u64) + Send + Sync + 'static,
    {
        self.callbacks.miss = Some(Box::new(callback));
        self
    }

    /// Installs a callback which is notified after every sweep with the
    /// remaining count, the flushed count and the elapsed milliseconds.
    pub fn on_flush<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize, u64) + Send + Sync + 'static,
    {
        self.callbacks.flush = Some(Box::new(callback));
        self
    }

    /// Installs a callback which receives every entry removed from the
    /// store - by a sweep, an invalidation, a replacement or a shutdown.
    pub fn on_evict<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, CacheEntry<V>) + Send + Sync + 'static,
    {
        self.callbacks.evict = Some(Box::new(callback));
        self
    }

    /// Validates the options and creates the cache.
    ///
    /// This spawns the background sweep and therefore has to be invoked
    /// within a tokio runtime.
    pub fn build(self) -> anyhow::Result<Arc<Cache<K, V>>> {
        self.options.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let cache = Arc::new(Cache {
            store,
            gates: GateRegistry::new(),
            loader: self.loader,
            callbacks: self.callbacks,
            stats: StatsCounters::default(),
            running: AtomicBool::new(true),
            shutdown_signal: Arc::new(Notify::new()),
            options: self.options,
        });

        Cache::spawn_sweep(
            Arc::downgrade(&cache),
            cache.options.flush_interval,
            cache.shutdown_signal.clone(),
        );

        log::debug!(
            "Cache {}: created - expiry {:?}, flush interval {:?}, size indicator {}",
            cache.options.name,
            cache.options.item_expiry,
            cache.options.flush_interval,
            cache.options.max_size_indicator
        );

        Ok(cache)
    }
}
