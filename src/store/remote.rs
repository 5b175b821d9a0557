//! Provides a store implementation which delegates to a Redis keyspace.
//!
//! All entries of a cache live under a shared namespace
//! (`"<cache name>:<key>"`). Values are stored as JSON together with the
//! wall clock instant they were loaded, which allows the store to
//! reconstruct best-effort timestamps on reads. Expiry however is owned by
//! Redis itself: every write sets the configured TTL, so the keyspace
//! forgets entries without any help from this process. Consequently the
//! [sweep](crate::store::KeyValueStore::flush_invalidated) and
//! [invalidate_all](crate::store::KeyValueStore::invalidate_all) are no-ops
//! and the size indicator of the cache is not enforced in this mode.
//!
//! Backend failures never surface to the cache user: a failed read is
//! reported (and logged) as a miss, a failed write as a rejection.
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entry::{CacheEntry, Instant};
use crate::store::{EvictFn, KeyValueStore, StoreWrite, UpdateFn};

/// Converts cache keys into Redis key fragments and back.
///
/// Implementations ship for the fixed-width integers, `f32`/`f64`, `String`,
/// [DateTime&lt;Utc&gt;](chrono::DateTime), [NaiveDate](chrono::NaiveDate)
/// and [Duration](std::time::Duration) (with millisecond precision). Any
/// other key type has to provide its own implementation.
pub trait RemoteKey: Sized {
    /// Renders this key as the string stored in Redis.
    fn write_key(&self) -> String;

    /// Parses a key which has previously been rendered via
    /// [write_key](RemoteKey::write_key).
    fn parse_key(raw: &str) -> anyhow::Result<Self>;
}

macro_rules! stringly_remote_key {
    ($($name:ty),+) => {
        $(impl RemoteKey for $name {
            fn write_key(&self) -> String {
                self.to_string()
            }

            fn parse_key(raw: &str) -> anyhow::Result<Self> {
                raw.parse().map_err(|error| {
                    anyhow::anyhow!("Unparsable cache key '{}': {}", raw, error)
                })
            }
        })+
    };
}

stringly_remote_key!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, f32, f64, String);

impl RemoteKey for DateTime<Utc> {
    fn write_key(&self) -> String {
        self.to_rfc3339()
    }

    fn parse_key(raw: &str) -> anyhow::Result<Self> {
        Ok(DateTime::parse_from_rfc3339(raw)
            .with_context(|| format!("Unparsable cache key '{}'", raw))?
            .with_timezone(&Utc))
    }
}

impl RemoteKey for NaiveDate {
    fn write_key(&self) -> String {
        self.to_string()
    }

    fn parse_key(raw: &str) -> anyhow::Result<Self> {
        raw.parse()
            .with_context(|| format!("Unparsable cache key '{}'", raw))
    }
}

impl RemoteKey for Duration {
    fn write_key(&self) -> String {
        self.as_millis().to_string()
    }

    fn parse_key(raw: &str) -> anyhow::Result<Self> {
        let millis: u64 = raw
            .parse()
            .with_context(|| format!("Unparsable cache key '{}'", raw))?;
        Ok(Duration::from_millis(millis))
    }
}

/// The JSON document kept per Redis key.
#[derive(Serialize, Deserialize)]
struct StoredValue<V> {
    value: V,
    loaded_at: DateTime<Utc>,
}

/// A store which keeps all entries in a Redis keyspace.
///
/// # Example
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use recache::cache::Cache;
/// # use recache::options::CacheOptions;
/// # use recache::store::RemoteStore;
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let store = RemoteStore::connect(
///         "redis://127.0.0.1:6379",
///         "users",
///         Duration::from_secs(60),
///     )
///     .await?;
///
///     let cache: Arc<Cache<u64, String>> = Cache::builder(CacheOptions::new("users"))
///         .store(Arc::new(store))
///         .loader(|id: u64| async move { Ok(format!("user-{}", id)) })
///         .build()?;
///
///     let _ = cache.get_or_load(&42, false).await?;
///     Ok(())
/// }
/// ```
pub struct RemoteStore {
    connection: ConnectionManager,
    namespace: String,
    ttl: Duration,
}

impl RemoteStore {
    /// Creates a store on top of an established connection.
    ///
    /// All keys are placed below the given namespace, which should equal the
    /// cache name. Every write applies the given time to live, which should
    /// equal the item expiry of the cache so that Redis and the coordinator
    /// agree on freshness.
    pub fn new(
        connection: ConnectionManager,
        namespace: impl Into<String>,
        ttl: Duration,
    ) -> anyhow::Result<Self> {
        let namespace = namespace.into();
        if namespace.trim().is_empty() {
            anyhow::bail!("A remote store requires a non-blank namespace!");
        }
        if ttl.is_zero() {
            anyhow::bail!(
                "Remote store {}: the TTL must be larger than zero!",
                namespace
            );
        }

        Ok(RemoteStore {
            connection,
            namespace,
            ttl,
        })
    }

    /// Connects to the given Redis URL and creates a store.
    pub async fn connect(
        url: &str,
        namespace: impl Into<String>,
        ttl: Duration,
    ) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid Redis URL: {}", url))?;
        let connection = client
            .get_connection_manager()
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", url))?;

        RemoteStore::new(connection, namespace, ttl)
    }

    fn redis_key<K: RemoteKey>(&self, key: &K) -> String {
        format!("{}:{}", self.namespace, key.write_key())
    }

    /// Fetches and decodes the document below the given Redis key.
    async fn fetch<V: DeserializeOwned>(&self, redis_key: &str) -> Option<CacheEntry<V>> {
        let mut connection = self.connection.clone();
        let raw: redis::RedisResult<Option<String>> = connection.get(redis_key).await;

        let raw = match raw {
            Ok(raw) => raw?,
            Err(error) => {
                log::warn!(
                    "Remote store {}: failed to fetch {}: {}",
                    self.namespace,
                    redis_key,
                    error
                );
                return None;
            }
        };

        self.decode(redis_key, &raw)
    }

    fn decode<V: DeserializeOwned>(&self, redis_key: &str, raw: &str) -> Option<CacheEntry<V>> {
        match serde_json::from_str::<StoredValue<V>>(raw) {
            Ok(stored) => {
                let age = (Utc::now() - stored.loaded_at).to_std().unwrap_or_default();
                Some(CacheEntry::with_age(stored.value, age))
            }
            Err(error) => {
                log::warn!(
                    "Remote store {}: dropping undecodable payload below {}: {}",
                    self.namespace,
                    redis_key,
                    error
                );
                None
            }
        }
    }

    /// Stores the given value below the given Redis key, applying the TTL.
    ///
    /// Returns **true** if the value was written (`if_absent` suppresses the
    /// write when the key already exists).
    async fn write<V: Serialize>(
        &self,
        redis_key: &str,
        value: &V,
        if_absent: bool,
    ) -> anyhow::Result<bool> {
        let payload = serde_json::to_string(&StoredValue {
            value,
            loaded_at: Utc::now(),
        })
        .context("Failed to serialize the value")?;

        let mut command = redis::cmd("SET");
        let _ = command.arg(redis_key).arg(payload);
        if if_absent {
            let _ = command.arg("NX");
        }
        let _ = command.arg("PX").arg(self.ttl.as_millis() as u64);

        let mut connection = self.connection.clone();
        let written: Option<String> = command
            .query_async(&mut connection)
            .await
            .context("Redis write failed")?;

        Ok(written.is_some())
    }

    async fn scan_keys(&self) -> Vec<String> {
        let mut connection = self.connection.clone();
        let pattern = format!("{}:*", self.namespace);
        let mut keys = Vec::new();

        // SCAN instead of KEYS - enumerating must never block the keyspace.
        let mut iter: redis::AsyncIter<'_, String> = match connection.scan_match(&pattern).await {
            Ok(iter) => iter,
            Err(error) => {
                log::warn!(
                    "Remote store {}: failed to scan the keyspace: {}",
                    self.namespace,
                    error
                );
                return keys;
            }
        };

        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }

        keys
    }
}

#[async_trait]
impl<K, V> KeyValueStore<K, V> for RemoteStore
where
    K: RemoteKey + Send + Sync + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn try_get(&self, key: &K) -> Option<CacheEntry<V>> {
        self.fetch(&self.redis_key(key)).await
    }

    async fn try_add(&self, key: K, value: V) -> bool {
        let redis_key = self.redis_key(&key);
        match self.write(&redis_key, &value, true).await {
            Ok(written) => written,
            Err(error) => {
                log::warn!(
                    "Remote store {}: rejected write for {}: {}",
                    self.namespace,
                    redis_key,
                    error
                );
                false
            }
        }
    }

    /// Note that in contrast to the in-memory store, read-modify-write is
    /// not atomic here: the updater is applied to the most recently fetched
    /// value on a best-effort basis.
    async fn add_or_update(&self, key: K, value: V, update: UpdateFn<'_, K, V>) -> StoreWrite<V> {
        let redis_key = self.redis_key(&key);

        let replaced: Option<CacheEntry<V>> = self.fetch(&redis_key).await;
        let value = match &replaced {
            Some(entry) => update(&key, entry.value()),
            None => value,
        };

        match self.write(&redis_key, &value, false).await {
            Ok(_) => StoreWrite {
                entry: Some(CacheEntry::new(value)),
                replaced,
            },
            Err(error) => {
                log::warn!(
                    "Remote store {}: rejected write for {}: {}",
                    self.namespace,
                    redis_key,
                    error
                );
                StoreWrite {
                    entry: None,
                    replaced,
                }
            }
        }
    }

    async fn try_remove(&self, key: &K) -> Option<CacheEntry<V>> {
        let redis_key = self.redis_key(key);
        let mut connection = self.connection.clone();

        let removed: redis::RedisResult<Option<String>> = connection.get_del(&redis_key).await;
        match removed {
            Ok(removed) => self.decode(&redis_key, &removed?),
            Err(error) => {
                log::warn!(
                    "Remote store {}: failed to remove {}: {}",
                    self.namespace,
                    redis_key,
                    error
                );
                None
            }
        }
    }

    async fn reset_expiry(&self, key: &K) -> bool {
        let redis_key = self.redis_key(key);
        let mut connection = self.connection.clone();

        let refreshed: redis::RedisResult<bool> = connection
            .pexpire(&redis_key, self.ttl.as_millis() as i64)
            .await;
        match refreshed {
            Ok(refreshed) => refreshed,
            Err(error) => {
                log::warn!(
                    "Remote store {}: failed to refresh the TTL of {}: {}",
                    self.namespace,
                    redis_key,
                    error
                );
                false
            }
        }
    }

    async fn contains(&self, key: &K) -> bool {
        let redis_key = self.redis_key(key);
        let mut connection = self.connection.clone();

        let present: redis::RedisResult<bool> = connection.exists(&redis_key).await;
        match present {
            Ok(present) => present,
            Err(error) => {
                log::warn!(
                    "Remote store {}: failed to check {}: {}",
                    self.namespace,
                    redis_key,
                    error
                );
                false
            }
        }
    }

    async fn entries(&self) -> Vec<(K, CacheEntry<V>)> {
        let prefix = format!("{}:", self.namespace);
        let mut result = Vec::new();

        for raw_key in self.scan_keys().await {
            let raw = match raw_key.strip_prefix(&prefix) {
                Some(raw) => raw,
                None => continue,
            };
            let key = match K::parse_key(raw) {
                Ok(key) => key,
                Err(error) => {
                    log::warn!(
                        "Remote store {}: skipping unparsable key {}: {}",
                        self.namespace,
                        raw_key,
                        error
                    );
                    continue;
                }
            };

            // The key might have expired between the scan and the fetch -
            // such hits simply vanish from the snapshot.
            if let Some(entry) = self.fetch(&raw_key).await {
                result.push((key, entry));
            }
        }

        result
    }

    async fn flush_invalidated(
        &self,
        _max_size: usize,
        _cutoff: Option<Instant>,
        _on_evict: EvictFn<'_, K, V>,
    ) -> usize {
        // Redis evicts expired keys on its own, so the sweep only reports
        // the current population.
        self.scan_keys().await.len()
    }

    async fn invalidate_all(&self, _on_evict: EvictFn<'_, K, V>) {
        // Eviction is owned by the remote system - this mirrors the
        // fire-and-forget contract of the sweep above.
        log::debug!(
            "Remote store {}: invalidate_all is a no-op, Redis owns eviction",
            self.namespace
        );
    }

    fn owns_expiry(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::RemoteKey;
    use chrono::{DateTime, NaiveDate, Utc};
    use std::time::Duration;

    #[test]
    fn numeric_keys_round_trip() {
        assert_eq!(i64::parse_key(&(-42i64).write_key()).unwrap(), -42);
        assert_eq!(u128::parse_key(&42u128.write_key()).unwrap(), 42);
        assert_eq!(f64::parse_key(&1.25f64.write_key()).unwrap(), 1.25);
        assert_eq!(i32::parse_key("not a number").is_err(), true);
    }

    #[test]
    fn string_keys_round_trip() {
        let key = "some cache key".to_owned();
        assert_eq!(String::parse_key(&key.write_key()).unwrap(), key);
    }

    #[test]
    fn calendar_keys_round_trip() {
        let timestamp: DateTime<Utc> = "2024-04-02T10:30:00Z".parse().unwrap();
        assert_eq!(
            DateTime::<Utc>::parse_key(&timestamp.write_key()).unwrap(),
            timestamp
        );

        let date = NaiveDate::from_ymd_opt(2024, 4, 2).unwrap();
        assert_eq!(NaiveDate::parse_key(&date.write_key()).unwrap(), date);
        assert_eq!(NaiveDate::parse_key("02.04.2024").is_err(), true);
    }

    #[test]
    fn durations_round_trip_with_millisecond_precision() {
        let duration = Duration::from_millis(1500);
        assert_eq!(Duration::parse_key(&duration.write_key()).unwrap(), duration);

        // Sub-millisecond fractions are truncated by design...
        let duration = Duration::from_micros(1500);
        assert_eq!(
            Duration::parse_key(&duration.write_key()).unwrap(),
            Duration::from_millis(1)
        );
    }
}
