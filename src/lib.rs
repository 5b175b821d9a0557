//! ReCache is a library providing an in-process, read-through key→value cache
//! with per-key single-flight loading.
//!
//! # Introduction
//! Applications which sit in front of an expensive resource (a database, a
//! search index, a remote service) commonly keep the hot part of that data in
//! memory. Doing this naively invites two classic failure modes: **cache
//! stampedes**, where a popular entry expires and every caller races to
//! reload it at once, and **synchronized expiry**, where thousands of entries
//! loaded together also expire together and hammer the upstream in one burst.
//!
//! ReCache addresses both. Each key is guarded by a **key gate** so that a
//! cold miss triggers at most one loader invocation per key - concurrent
//! callers either wait for that load or fail fast with a circuit breaker
//! error, depending on the configured timeout. Expiry can be **jittered** by
//! a configurable percentage so that entries loaded together drift apart
//! again. A background **sweep** evicts expired entries and trims oversized
//! populations toward a configurable size indicator.
//!
//! # Features
//! * **Read-through loading** - [`cache::Cache::get_or_load`] consults the
//!   store and only invokes the loader on a miss, serialized per key.
//! * **Circuit breaker** - additional callers for a key which is currently
//!   being loaded wait at most a configurable amount of time before they
//!   give up with a [`cache::CircuitBreakerTimeout`].
//! * **Background eviction** - a periodic sweep removes expired entries and
//!   trims the population down to the configured size indicator, oldest
//!   entries first.
//! * **Pluggable stores** - the coordinator operates against the
//!   [`store::KeyValueStore`] trait. [`store::InMemoryStore`] keeps entries
//!   in a concurrent map and owns all timestamps;
//!   [`store::RemoteStore`] delegates to a Redis keyspace and defers expiry
//!   to the remote system.
//! * **Self refreshing mode** - [`refresh::SelfRefreshingCache`] proactively
//!   reloads every cached key on a fixed cadence, which keeps expensive but
//!   rarely changing data permanently warm.
//! * **100% Async/Await** - the whole crate builds upon
//!   [tokio](https://tokio.rs/) and async/await primitives as provided by
//!   Rust.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use recache::cache::Cache;
//! use recache::options::CacheOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = CacheOptions::new("users")
//!         .with_item_expiry(Duration::from_secs(60))
//!         .with_flush_interval(Duration::from_secs(5));
//!
//!     let cache: Arc<Cache<u64, String>> = Cache::builder(options)
//!         .loader(|id: u64| async move {
//!             // Talk to the expensive upstream here...
//!             Ok(format!("user-{}", id))
//!         })
//!         .build()?;
//!
//!     // The first call loads, every subsequent call within the expiry
//!     // window is served from memory...
//!     assert_eq!(cache.get_or_load(&42, false).await?, "user-42");
//!     assert_eq!(cache.get_or_load(&42, false).await?, "user-42");
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//! * **cache**: The coordinator which wires the store, the key gates, the
//!   loader and the background sweep together. See [`crate::cache`].
//! * **store**: The pluggable key→value store contract along with the
//!   in-memory and the Redis backed implementation. See [`crate::store`].
//! * **refresh**: The self-refreshing wrapper around a coordinator. See
//!   [`crate::refresh`].
//! * **options**: All tuning knobs along with their validation. See
//!   [`crate::options`].
//! * **stats**: Lock-free runtime metrics of a cache. See [`crate::stats`].
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod cache;
pub mod entry;
mod gate;
pub mod options;
pub mod refresh;
pub mod stats;
pub mod store;


/// Initializes the logging system.
///
/// This sets up **simplelog** to log to stdout, which is all that is needed
/// when running inside a container. Applications which already initialize a
/// `log` backend of their own should simply not call this.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}
