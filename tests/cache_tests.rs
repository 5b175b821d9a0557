//! End-to-end tests of the coordinator against the in-memory store.
//!
//! These tests run against the real clock - expiries and sweep intervals are
//! kept short so that the suite stays fast, with enough margin that busy CI
//! machines do not flip the assertions.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use recache::cache::{Cache, CircuitBreakerTimeout};
use recache::entry::CacheEntry;
use recache::options::{CacheOptions, SelfRefreshingCacheOptions};
use recache::refresh::SelfRefreshingCache;
use recache::store::{EvictFn, InMemoryStore, KeyValueStore, StoreWrite, UpdateFn};

fn quiet_options(name: &str) -> CacheOptions {
    CacheOptions::new(name)
        .with_item_expiry(Duration::from_secs(60))
        .with_flush_interval(Duration::from_secs(3600))
}

#[tokio::test]
async fn counting_after_inserts_sees_every_entry() {
    let cache: Arc<Cache<i32, String>> = Cache::builder(quiet_options("count")).build().unwrap();

    for key in 0..100 {
        assert_eq!(cache.try_add(key, key.to_string()).await, true);
    }

    assert_eq!(cache.len().await, 100);
    cache.shutdown().await;
}

#[tokio::test]
async fn added_values_can_be_read_back_until_they_expire() {
    let options = CacheOptions::new("expiry")
        .with_item_expiry(Duration::from_secs(1))
        .with_flush_interval(Duration::from_millis(100));
    let cache: Arc<Cache<i32, String>> = Cache::builder(options).build().unwrap();

    assert_eq!(cache.try_add(1, "x".to_owned()).await, true);
    assert_eq!(cache.get(&1, false).await, Some("x".to_owned()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.get(&1, false).await, None);

    cache.shutdown().await;
}

#[tokio::test]
async fn the_sweep_trims_the_population_to_the_size_indicator() {
    let options = CacheOptions::new("trim")
        .with_item_expiry(Duration::from_secs(60))
        .with_flush_interval(Duration::from_millis(500))
        .with_max_size_indicator(99);
    let cache: Arc<Cache<i32, i32>> = Cache::builder(options)
        .loader(|key: i32| async move { Ok(key) })
        .build()
        .unwrap();

    for key in 0..200 {
        let _ = cache.get_or_load(&key, false).await.unwrap();
    }
    assert_eq!(cache.len().await, 200);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.len().await, 99);

    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_trigger_a_single_load_per_key() {
    let loads = Arc::new(AtomicUsize::new(0));

    let counting_loads = loads.clone();
    let options = quiet_options("single-flight").with_circuit_breaker_timeout(None);
    let cache: Arc<Cache<i32, String>> = Cache::builder(options)
        .loader(move |key: i32| {
            let loads = counting_loads.clone();
            async move {
                let pause = rand::thread_rng().gen_range(0..50);
                tokio::time::sleep(Duration::from_millis(pause)).await;
                let _ = loads.fetch_add(1, Ordering::SeqCst);
                Ok(key.to_string())
            }
        })
        .build()
        .unwrap();

    let mut workers = Vec::new();
    for _ in 0..15 {
        let cache = cache.clone();
        workers.push(tokio::spawn(async move {
            for i in 0..500 {
                let key = match i {
                    100 | 200 | 300 | 400 => i,
                    _ => 7,
                };
                let value = cache.get_or_load(&key, false).await.unwrap();
                assert_eq!(value, key.to_string());
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    // Five distinct keys were requested, so five loads happened - no matter
    // how many callers raced for them.
    assert_eq!(loads.load(Ordering::SeqCst), 5);

    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_zero_timeout_makes_additional_callers_fail_fast() {
    let loads = Arc::new(AtomicUsize::new(0));
    let trips = Arc::new(AtomicUsize::new(0));

    let counting_loads = loads.clone();
    let options = quiet_options("short-circuit")
        .with_circuit_breaker_timeout(Some(Duration::ZERO));
    let cache: Arc<Cache<i32, String>> = Cache::builder(options)
        .loader(move |key: i32| {
            let loads = counting_loads.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20 + (key as u64 % 30))).await;
                let _ = loads.fetch_add(1, Ordering::SeqCst);
                Ok(key.to_string())
            }
        })
        .build()
        .unwrap();

    let mut workers = Vec::new();
    for _ in 0..15 {
        let cache = cache.clone();
        let trips = trips.clone();
        workers.push(tokio::spawn(async move {
            for i in 0..500 {
                let key = match i {
                    100 | 200 | 300 | 400 => i,
                    _ => 7,
                };
                match cache.get_or_load(&key, false).await {
                    Ok(value) => assert_eq!(value, key.to_string()),
                    Err(error) => {
                        // The only permitted failure is the circuit breaker...
                        assert_eq!(
                            error.downcast_ref::<CircuitBreakerTimeout>().is_some(),
                            true
                        );
                        let _ = trips.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(loads.load(Ordering::SeqCst), 5);
    // While each of the five loads was in flight, the other callers
    // short-circuited instead of piling up on the gate.
    assert_eq!(trips.load(Ordering::SeqCst) > 5, true);

    cache.shutdown().await;
}

#[tokio::test]
async fn the_flush_callback_reports_every_sweep() {
    let flushes = Arc::new(AtomicUsize::new(0));

    let counting_flushes = flushes.clone();
    let options = CacheOptions::new("flush-callback")
        .with_item_expiry(Duration::from_secs(1))
        .with_flush_interval(Duration::from_millis(500));
    let cache: Arc<Cache<i32, i32>> = Cache::builder(options)
        .on_flush(move |_remaining, _flushed, _elapsed_ms| {
            let _ = counting_flushes.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    for key in 0..1000 {
        let _ = cache.try_add(key, key).await;
    }

    tokio::time::sleep(Duration::from_millis(2200)).await;

    // Sweeps ran at ~0.5s, ~1.0s, ~1.5s and ~2.0s - the ~1.5s one is the
    // first to observe the entries as stale in bulk. A slow machine may defer
    // the last tick beyond our probe, hence the lower bound.
    let flushes = flushes.load(Ordering::SeqCst);
    assert_eq!((3..=4).contains(&flushes), true, "saw {} flushes", flushes);
    assert_eq!(cache.len().await, 0);

    cache.shutdown().await;
}

#[tokio::test]
async fn read_through_loading_is_idempotent_within_the_expiry_window() {
    let loads = Arc::new(AtomicUsize::new(0));

    let counting_loads = loads.clone();
    let cache: Arc<Cache<i32, String>> = Cache::builder(quiet_options("idempotent"))
        .loader(move |key: i32| {
            let loads = counting_loads.clone();
            async move {
                let _ = loads.fetch_add(1, Ordering::SeqCst);
                Ok(format!("value-{}", key))
            }
        })
        .build()
        .unwrap();

    assert_eq!(cache.get_or_load(&1, false).await.unwrap(), "value-1");
    assert_eq!(cache.get_or_load(&1, false).await.unwrap(), "value-1");
    assert_eq!(cache.get(&1, false).await, Some("value-1".to_owned()));
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    cache.shutdown().await;
}

#[tokio::test]
async fn invalidation_removes_entries_and_reports_them() {
    let evicted = Arc::new(AtomicUsize::new(0));

    let counting_evictions = evicted.clone();
    let cache: Arc<Cache<i32, String>> = Cache::builder(quiet_options("invalidate"))
        .on_evict(move |_key, _entry| {
            let _ = counting_evictions.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    assert_eq!(cache.try_add(1, "one".to_owned()).await, true);
    assert_eq!(cache.contains_key(&1).await, true);

    assert_eq!(cache.invalidate(&1).await, true);
    assert_eq!(cache.contains_key(&1).await, false);
    assert_eq!(cache.invalidate(&1).await, false);
    assert_eq!(evicted.load(Ordering::SeqCst), 1);

    for key in 0..10 {
        let _ = cache.try_add(key, key.to_string()).await;
    }
    cache.invalidate_all().await;
    assert_eq!(cache.is_empty().await, true);
    assert_eq!(cache.entries().await.is_empty(), true);
    assert_eq!(evicted.load(Ordering::SeqCst), 11);

    cache.shutdown().await;
}

#[tokio::test]
async fn a_failing_loader_propagates_and_releases_the_gate() {
    let attempts = Arc::new(AtomicUsize::new(0));

    let counting_attempts = attempts.clone();
    let cache: Arc<Cache<i32, String>> = Cache::builder(quiet_options("loader-failure"))
        .loader(move |key: i32| {
            let attempts = counting_attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("upstream unavailable");
                }
                Ok(format!("value-{}", key))
            }
        })
        .build()
        .unwrap();

    // The first attempt fails and nothing is cached...
    let error = cache.get_or_load(&1, false).await.unwrap_err();
    assert_eq!(format!("{}", error), "upstream unavailable");
    assert_eq!(cache.contains_key(&1).await, false);

    // ...but the gate was released, so the next caller simply retries.
    assert_eq!(cache.get_or_load(&1, false).await.unwrap(), "value-1");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().load_failures, 1);

    cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn circuit_breaker_errors_identify_cache_and_key() {
    let options = quiet_options("breaker").with_circuit_breaker_timeout(Some(Duration::ZERO));
    let cache: Arc<Cache<i32, String>> = Cache::builder(options)
        .loader(|key: i32| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(key.to_string())
        })
        .build()
        .unwrap();

    let loading = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_or_load(&7, false).await })
    };

    // Give the loader a head start, then collide with it...
    tokio::time::sleep(Duration::from_millis(50)).await;
    let error = cache.get_or_load(&7, false).await.unwrap_err();

    let timeout = error.downcast_ref::<CircuitBreakerTimeout>().unwrap();
    assert_eq!(timeout.cache_name(), "breaker");
    assert_eq!(timeout.key(), "7");
    assert_eq!(timeout.timeout(), Duration::ZERO);

    assert_eq!(loading.await.unwrap().unwrap(), "7");
    cache.shutdown().await;
}

#[tokio::test]
async fn hit_and_miss_callbacks_observe_the_read_path() {
    let hits = Arc::new(AtomicUsize::new(0));
    let misses = Arc::new(AtomicUsize::new(0));

    let counting_hits = hits.clone();
    let counting_misses = misses.clone();
    let cache: Arc<Cache<i32, String>> = Cache::builder(quiet_options("callbacks"))
        .loader(|key: i32| async move { Ok(key.to_string()) })
        .on_hit(move |_key, _entry| {
            let _ = counting_hits.fetch_add(1, Ordering::SeqCst);
        })
        .on_miss(move |key, entry, _elapsed_ms| {
            assert_eq!(entry.value(), &key.to_string());
            let _ = counting_misses.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let _ = cache.get_or_load(&1, false).await.unwrap();
    let _ = cache.get_or_load(&1, false).await.unwrap();
    let _ = cache.get(&1, false).await.unwrap();

    assert_eq!(misses.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let stats = cache.stats();
    assert_eq!(stats.reads, 3);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.loads, 1);

    cache.shutdown().await;
}

/// A store which accepts reads but refuses every write of the read-through
/// path, emulating an unavailable backend.
struct RejectingStore {
    inner: InMemoryStore<i32, String>,
}

#[async_trait::async_trait]
impl KeyValueStore<i32, String> for RejectingStore {
    async fn try_get(&self, key: &i32) -> Option<CacheEntry<String>> {
        self.inner.try_get(key).await
    }

    async fn try_add(&self, key: i32, value: String) -> bool {
        self.inner.try_add(key, value).await
    }

    async fn add_or_update(
        &self,
        _key: i32,
        _value: String,
        _update: UpdateFn<'_, i32, String>,
    ) -> StoreWrite<String> {
        StoreWrite {
            entry: None,
            replaced: None,
        }
    }

    async fn try_remove(&self, key: &i32) -> Option<CacheEntry<String>> {
        self.inner.try_remove(key).await
    }

    async fn reset_expiry(&self, key: &i32) -> bool {
        self.inner.reset_expiry(key).await
    }

    async fn contains(&self, key: &i32) -> bool {
        self.inner.contains(key).await
    }

    async fn entries(&self) -> Vec<(i32, CacheEntry<String>)> {
        self.inner.entries().await
    }

    async fn flush_invalidated(
        &self,
        max_size: usize,
        cutoff: Option<std::time::Instant>,
        on_evict: EvictFn<'_, i32, String>,
    ) -> usize {
        self.inner.flush_invalidated(max_size, cutoff, on_evict).await
    }

    async fn invalidate_all(&self, on_evict: EvictFn<'_, i32, String>) {
        self.inner.invalidate_all(on_evict).await
    }
}

#[tokio::test]
async fn a_rejected_store_write_still_returns_the_loaded_value() {
    let cache: Arc<Cache<i32, String>> = Cache::builder(quiet_options("rejecting"))
        .store(Arc::new(RejectingStore {
            inner: InMemoryStore::new(),
        }))
        .loader(|key: i32| async move { Ok(format!("value-{}", key)) })
        .build()
        .unwrap();

    // The store refuses to retain the value, the caller gets it anyway...
    assert_eq!(cache.get_or_load(&1, false).await.unwrap(), "value-1");
    assert_eq!(cache.contains_key(&1).await, false);

    cache.shutdown().await;
}

#[tokio::test]
async fn the_refresh_loop_keeps_entries_warm() {
    let loads = Arc::new(AtomicUsize::new(0));

    let counting_loads = loads.clone();
    let options = SelfRefreshingCacheOptions::new(
        CacheOptions::new("warm")
            .with_item_expiry(Duration::from_secs(1))
            .with_flush_interval(Duration::from_secs(3600)),
        Duration::from_millis(100),
    );
    let cache: Arc<SelfRefreshingCache<i32, String>> = SelfRefreshingCache::builder(options)
        .loader(move |key: i32| {
            let loads = counting_loads.clone();
            async move {
                let _ = loads.fetch_add(1, Ordering::SeqCst);
                Ok(format!("value-{}", key))
            }
        })
        .build()
        .unwrap();

    let _ = cache.get_or_load(&1, false).await.unwrap();

    // Each refresh tick resets the expiry well before it runs out, so the
    // entry outlives its nominal one second expiry without a single reload...
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.get(&1, false).await, Some("value-1".to_owned()));
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    cache.shutdown().await;
}

#[tokio::test]
async fn the_refresh_loop_reloads_expired_entries() {
    let loads = Arc::new(AtomicUsize::new(0));

    let counting_loads = loads.clone();
    let options = SelfRefreshingCacheOptions::new(
        CacheOptions::new("reload")
            .with_item_expiry(Duration::from_millis(150))
            .with_flush_interval(Duration::from_secs(3600)),
        Duration::from_millis(400),
    );
    let cache: Arc<SelfRefreshingCache<i32, String>> = SelfRefreshingCache::builder(options)
        .loader(move |key: i32| {
            let loads = counting_loads.clone();
            async move {
                let _ = loads.fetch_add(1, Ordering::SeqCst);
                Ok(format!("value-{}", key))
            }
        })
        .build()
        .unwrap();

    let _ = cache.get_or_load(&1, false).await.unwrap();

    // With a cadence beyond the expiry, every tick finds the entry stale and
    // actually reloads it - without any caller involved.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(loads.load(Ordering::SeqCst) >= 2, true);
    assert_eq!(cache.contains_key(&1).await, true);

    cache.shutdown().await;
}
