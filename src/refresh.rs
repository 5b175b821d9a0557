//! Provides a cache which proactively refreshes its entries.
//!
//! A [SelfRefreshingCache](SelfRefreshingCache) wraps a
//! [Cache](crate::cache::Cache) and drives a periodic loop: on every tick it
//! snapshots the currently cached keys and performs a read-through access
//! with an expiry reset for each of them, all in parallel. A fresh entry is
//! thereby kept alive, an expired one is reloaded - so as long as the
//! refresh cadence is shorter than the item expiry, the cached data stays
//! permanently warm without any caller ever paying for a load.
//!
//! This pays off for data whose upstream rarely changes but whose loader is
//! expensive. Combined with the size indicator and the sweep of the
//! underlying cache, the total population stays bounded.
//!
//! # Example
//! ```
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use recache::options::{CacheOptions, SelfRefreshingCacheOptions};
//! # use recache::refresh::SelfRefreshingCache;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = SelfRefreshingCacheOptions::new(
//!         CacheOptions::new("rates").with_item_expiry(Duration::from_secs(60)),
//!         Duration::from_secs(20),
//!     );
//!
//!     let cache: Arc<SelfRefreshingCache<String, f64>> =
//!         SelfRefreshingCache::builder(options)
//!             .loader(|_currency: String| async move {
//!                 // Fetch the current rate from the expensive upstream...
//!                 Ok(1.09)
//!             })
//!             .build()?;
//!
//!     // The first access loads, the refresh loop keeps the entry warm from
//!     // here on...
//!     let rate = cache.get_or_load(&"EUR".to_owned(), false).await?;
//!     assert_eq!(rate, 1.09);
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use crate::cache::{Cache, CacheBuilder};
use crate::entry::CacheEntry;
use crate::options::SelfRefreshingCacheOptions;
use crate::stats::CacheStats;
use crate::store::KeyValueStore;

/// A cache which reloads every currently cached key on a fixed cadence.
///
/// Built via [SelfRefreshingCache::builder](SelfRefreshingCache::builder).
/// In contrast to a plain [Cache](Cache), a default loader is mandatory -
/// without one there is nothing the refresh loop could do.
pub struct SelfRefreshingCache<K, V> {
    cache: Arc<Cache<K, V>>,
    refresh_interval: Duration,
    running: AtomicBool,
    shutdown_signal: Arc<Notify>,
}

impl<K, V> SelfRefreshingCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a builder for a self-refreshing cache with the given options.
    pub fn builder(options: SelfRefreshingCacheOptions) -> SelfRefreshingCacheBuilder<K, V> {
        SelfRefreshingCacheBuilder {
            refresh_interval: options.refresh_interval,
            inner: Cache::builder(options.cache),
        }
    }

    /// Provides access to the wrapped coordinator.
    pub fn cache(&self) -> &Arc<Cache<K, V>> {
        &self.cache
    }

    /// Returns the cadence of the refresh loop.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Delegates to [Cache::get_or_load](Cache::get_or_load).
    pub async fn get_or_load(&self, key: &K, reset_expiry_on_hit: bool) -> anyhow::Result<V> {
        self.cache.get_or_load(key, reset_expiry_on_hit).await
    }

    /// Delegates to [Cache::get](Cache::get).
    pub async fn get(&self, key: &K, reset_expiry_on_hit: bool) -> Option<V> {
        self.cache.get(key, reset_expiry_on_hit).await
    }

    /// Delegates to [Cache::try_add](Cache::try_add).
    pub async fn try_add(&self, key: K, value: V) -> bool {
        self.cache.try_add(key, value).await
    }

    /// Delegates to [Cache::invalidate](Cache::invalidate).
    pub async fn invalidate(&self, key: &K) -> bool {
        self.cache.invalidate(key).await
    }

    /// Delegates to [Cache::invalidate_all](Cache::invalidate_all).
    pub async fn invalidate_all(&self) {
        self.cache.invalidate_all().await
    }

    /// Delegates to [Cache::contains_key](Cache::contains_key).
    pub async fn contains_key(&self, key: &K) -> bool {
        self.cache.contains_key(key).await
    }

    /// Delegates to [Cache::len](Cache::len).
    pub async fn len(&self) -> usize {
        self.cache.len().await
    }

    /// Delegates to [Cache::is_empty](Cache::is_empty).
    pub async fn is_empty(&self) -> bool {
        self.cache.is_empty().await
    }

    /// Delegates to [Cache::entries](Cache::entries).
    pub async fn entries(&self) -> Vec<(K, CacheEntry<V>)> {
        self.cache.entries().await
    }

    /// Delegates to [Cache::flush_invalidated_entries](Cache::flush_invalidated_entries).
    pub async fn flush_invalidated_entries(&self) {
        self.cache.flush_invalidated_entries().await
    }

    /// Delegates to [Cache::stats](Cache::stats).
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Delegates to [Cache::name](Cache::name).
    pub fn name(&self) -> &str {
        self.cache.name()
    }

    /// Determines if this cache is still operational or has been shut down.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shuts this cache down.
    ///
    /// Stops the refresh loop, cancels an in-flight refresh cooperatively
    /// and shuts the wrapped cache down (which in turn stops its sweep and
    /// evicts all entries).
    pub async fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown_signal.notify_waiters();
            self.cache.shutdown().await;
        }
    }

    /// Reloads all currently cached keys in parallel.
    ///
    /// Keys are captured as a snapshot upfront. A key which is invalidated
    /// in between simply gets re-populated by its refresh - a benign race.
    /// Individual failures are logged and never stop the remaining
    /// refreshes.
    async fn refresh_all(&self) {
        let keys: Vec<K> = self
            .cache
            .entries()
            .await
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        if keys.is_empty() {
            return;
        }
        let count = keys.len();

        let refreshes = keys.iter().map(|key| async move {
            if let Err(error) = self.cache.get_or_load(key, true).await {
                log::warn!(
                    "Cache {}: background refresh of key {:?} failed: {}",
                    self.cache.name(),
                    key,
                    error
                );
            }
        });

        tokio::select! {
            _ = futures::future::join_all(refreshes) => {
                log::debug!("Cache {}: refreshed {} keys", self.cache.name(), count);
            }
            _ = self.shutdown_signal.notified() => {
                log::debug!("Cache {}: refresh interrupted by shutdown", self.cache.name());
            }
        }
    }

    fn spawn_refresh(
        cache: Weak<SelfRefreshingCache<K, V>>,
        refresh_interval: Duration,
        shutdown: Arc<Notify>,
    ) {
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(refresh_interval) => (),
                    _ = shutdown.notified() => break,
                }

                match cache.upgrade() {
                    Some(cache) if cache.is_running() => cache.refresh_all().await,
                    _ => break,
                }
            }
        }));
    }
}

/// Assembles a [SelfRefreshingCache](SelfRefreshingCache).
///
/// Obtained via [SelfRefreshingCache::builder](SelfRefreshingCache::builder).
/// Mirrors the [CacheBuilder](crate::cache::CacheBuilder) surface, with the
/// difference that a default loader is mandatory.
pub struct SelfRefreshingCacheBuilder<K, V> {
    refresh_interval: Duration,
    inner: CacheBuilder<K, V>,
}

impl<K, V> SelfRefreshingCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Specifies the backing store of the wrapped cache.
    pub fn store(mut self, store: Arc<dyn KeyValueStore<K, V>>) -> Self {
        self.inner = self.inner.store(store);
        self
    }

    /// Specifies the loader used for both read-through accesses and the
    /// refresh loop.
    pub fn loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.inner = self.inner.loader(loader);
        self
    }

    /// Installs a hit callback on the wrapped cache.
    pub fn on_hit<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &CacheEntry<V>) + Send + Sync + 'static,
    {
        self.inner = self.inner.on_hit(callback);
        self
    }

    /// Installs a miss callback on the wrapped cache.
    pub fn on_miss<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &CacheEntry<V>, u64) + Send + Sync + 'static,
    {
        self.inner = self.inner.on_miss(callback);
        self
    }

    /// Installs a flush callback on the wrapped cache.
    pub fn on_flush<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize, u64) + Send + Sync + 'static,
    {
        self.inner = self.inner.on_flush(callback);
        self
    }

    /// Installs an evict callback on the wrapped cache.
    pub fn on_evict<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, CacheEntry<V>) + Send + Sync + 'static,
    {
        self.inner = self.inner.on_evict(callback);
        self
    }

    /// Validates the options and creates the cache.
    ///
    /// This spawns the refresh loop (and the sweep of the wrapped cache) and
    /// therefore has to be invoked within a tokio runtime.
    ///
    /// # Errors
    /// Fails if the cache options are invalid, the refresh interval is zero
    /// or no loader was configured.
    pub fn build(self) -> anyhow::Result<Arc<SelfRefreshingCache<K, V>>> {
        if self.refresh_interval.is_zero() {
            anyhow::bail!("A self-refreshing cache requires a refresh interval larger than zero!");
        }

        let cache = self.inner.build()?;
        if !cache.has_loader() {
            anyhow::bail!(
                "Cache {}: a self-refreshing cache requires a default loader!",
                cache.name()
            );
        }

        let refreshing = Arc::new(SelfRefreshingCache {
            refresh_interval: self.refresh_interval,
            running: AtomicBool::new(true),
            shutdown_signal: Arc::new(Notify::new()),
            cache,
        });

        SelfRefreshingCache::spawn_refresh(
            Arc::downgrade(&refreshing),
            refreshing.refresh_interval,
            refreshing.shutdown_signal.clone(),
        );

        log::debug!(
            "Cache {}: self-refreshing every {:?}",
            refreshing.name(),
            refreshing.refresh_interval
        );

        Ok(refreshing)
    }
}

#[cfg(test)]
mod tests {
    use super::SelfRefreshingCache;
    use crate::options::{CacheOptions, SelfRefreshingCacheOptions};
    use std::sync::Arc;
    use std::time::Duration;

    fn options(refresh_interval: Duration) -> SelfRefreshingCacheOptions {
        SelfRefreshingCacheOptions::new(
            CacheOptions::new("test").with_flush_interval(Duration::from_secs(3600)),
            refresh_interval,
        )
    }

    #[tokio::test]
    async fn a_zero_refresh_interval_is_rejected() {
        let result: anyhow::Result<Arc<SelfRefreshingCache<i32, i32>>> =
            SelfRefreshingCache::builder(options(Duration::ZERO))
                .loader(|key: i32| async move { Ok(key) })
                .build();
        assert_eq!(result.is_err(), true);
    }

    #[tokio::test]
    async fn a_missing_loader_is_rejected() {
        let result: anyhow::Result<Arc<SelfRefreshingCache<i32, i32>>> =
            SelfRefreshingCache::builder(options(Duration::from_secs(1))).build();
        assert_eq!(result.is_err(), true);
    }

    #[tokio::test]
    async fn the_coordinator_surface_is_delegated() {
        let _guard = crate::test_support::clock_lock();

        let cache: Arc<SelfRefreshingCache<i32, String>> =
            SelfRefreshingCache::builder(options(Duration::from_secs(3600)))
                .loader(|key: i32| async move { Ok(format!("loaded-{}", key)) })
                .build()
                .unwrap();

        assert_eq!(cache.get_or_load(&1, false).await.unwrap(), "loaded-1");
        assert_eq!(cache.get(&1, false).await, Some("loaded-1".to_owned()));
        assert_eq!(cache.contains_key(&1).await, true);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.stats().loads, 1);

        assert_eq!(cache.invalidate(&1).await, true);
        assert_eq!(cache.is_empty().await, true);

        cache.shutdown().await;
        assert_eq!(cache.is_running(), false);
        assert_eq!(cache.cache().is_running(), false);
    }
}
