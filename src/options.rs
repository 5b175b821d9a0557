//! Provides all tuning knobs of a cache.
//!
//! [CacheOptions](CacheOptions) collects everything a
//! [Cache](crate::cache::Cache) needs to know about expiry, sweeping, size
//! trimming and the circuit breaker. Options are validated once when the
//! cache is built and are immutable afterwards.
//!
//! # Example
//! ```
//! # use std::time::Duration;
//! # use recache::options::CacheOptions;
//! let options = CacheOptions::new("products")
//!     .with_item_expiry(Duration::from_secs(15 * 60))
//!     .with_expiry_randomization_percent(10)
//!     .with_flush_interval(Duration::from_secs(30))
//!     .with_max_size_indicator(10_000)
//!     .with_circuit_breaker_timeout(Some(Duration::from_secs(2)));
//!
//! assert_eq!(options.validate().is_ok(), true);
//! ```
use std::time::Duration;

/// Collects the settings of a single cache.
///
/// Obtained via [CacheOptions::new](CacheOptions::new) which provides
/// conservative defaults for everything but the name. All settings can be
/// customized using the `with_` methods.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Contains the name of the cache as used in log messages and errors.
    /// Must not be blank.
    pub name: String,

    /// Specifies how long a loaded entry is considered fresh. Must be
    /// greater than zero.
    pub item_expiry: Duration,

    /// Specifies the expiry jitter window as a percentage (`0..=100`) of
    /// [item_expiry](CacheOptions::item_expiry).
    ///
    /// When many entries are loaded together they would also all expire
    /// together and trigger a thundering herd of reloads. With a percentage
    /// of `p`, each freshness check draws an effective expiry uniformly from
    /// `item_expiry * (1 - p/200)` up to (excluding)
    /// `item_expiry * (1 + p/200)`, which spreads the reloads out.
    pub expiry_randomization_percent: u32,

    /// Specifies how often the background sweep runs. Must be greater than
    /// zero.
    pub flush_interval: Duration,

    /// Specifies the soft ceiling for the number of entries.
    ///
    /// This is only enforced by the sweep: after expired entries have been
    /// removed, the remaining population is trimmed down to this value,
    /// discarding the entries with the oldest load time first (ties broken
    /// by the oldest read). In between sweeps the cache may grow beyond this
    /// value. Note that a value of zero therefore causes every sweep to
    /// evict all entries.
    pub max_size_indicator: usize,

    /// Bounds how long a caller waits for the per-key gate while another
    /// caller is already loading the same key.
    ///
    /// `Some(Duration::ZERO)` makes additional callers fail immediately,
    /// `None` makes them wait for the running load without any limit. When
    /// the bound is exceeded, the caller receives a
    /// [CircuitBreakerTimeout](crate::cache::CircuitBreakerTimeout).
    pub circuit_breaker_timeout: Option<Duration>,
}

impl CacheOptions {
    /// Creates options for a cache with the given name.
    ///
    /// The defaults are: entries expire after one minute without jitter, the
    /// sweep runs every ten seconds, the size indicator permits 16384
    /// entries and additional callers wait up to five seconds on the key
    /// gate.
    pub fn new(name: impl Into<String>) -> Self {
        CacheOptions {
            name: name.into(),
            item_expiry: Duration::from_secs(60),
            expiry_randomization_percent: 0,
            flush_interval: Duration::from_secs(10),
            max_size_indicator: 16_384,
            circuit_breaker_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Specifies how long a loaded entry stays fresh.
    pub fn with_item_expiry(mut self, item_expiry: Duration) -> Self {
        self.item_expiry = item_expiry;
        self
    }

    /// Specifies the expiry jitter window in percent (`0..=100`) of the item
    /// expiry.
    pub fn with_expiry_randomization_percent(mut self, percent: u32) -> Self {
        self.expiry_randomization_percent = percent;
        self
    }

    /// Specifies how often the background sweep runs.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Specifies the soft ceiling for the number of entries, enforced by the
    /// sweep.
    pub fn with_max_size_indicator(mut self, max_size_indicator: usize) -> Self {
        self.max_size_indicator = max_size_indicator;
        self
    }

    /// Specifies how long additional callers wait on the key gate.
    ///
    /// See [circuit_breaker_timeout](CacheOptions::circuit_breaker_timeout)
    /// for the exact semantics of `Some(Duration::ZERO)` and `None`.
    pub fn with_circuit_breaker_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.circuit_breaker_timeout = timeout;
        self
    }

    /// Ensures that these options describe a usable cache.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("A cache requires a non-blank name!");
        }
        if self.item_expiry.is_zero() {
            anyhow::bail!("Cache {}: the item expiry must be larger than zero!", self.name);
        }
        if self.flush_interval.is_zero() {
            anyhow::bail!(
                "Cache {}: the flush interval must be larger than zero!",
                self.name
            );
        }
        if self.expiry_randomization_percent > 100 {
            anyhow::bail!(
                "Cache {}: the expiry randomization must be within 0..=100 percent!",
                self.name
            );
        }

        Ok(())
    }

    /// Returns the absolute width of the expiry jitter window.
    pub(crate) fn jitter_window(&self) -> Duration {
        self.item_expiry * self.expiry_randomization_percent / 100
    }
}

/// Collects the settings of a [SelfRefreshingCache](crate::refresh::SelfRefreshingCache).
///
/// This embeds the [CacheOptions](CacheOptions) of the underlying coordinator
/// and adds the cadence of the refresh loop.
#[derive(Clone, Debug)]
pub struct SelfRefreshingCacheOptions {
    /// Contains the options of the wrapped cache.
    pub cache: CacheOptions,

    /// Specifies how often all currently cached keys are reloaded. Must be
    /// greater than zero.
    pub refresh_interval: Duration,
}

impl SelfRefreshingCacheOptions {
    /// Creates options which refresh all entries of a cache with the given
    /// options in the given interval.
    pub fn new(cache: CacheOptions, refresh_interval: Duration) -> Self {
        SelfRefreshingCacheOptions {
            cache,
            refresh_interval,
        }
    }

    /// Ensures that these options describe a usable self-refreshing cache.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.cache.validate()?;

        if self.refresh_interval.is_zero() {
            anyhow::bail!(
                "Cache {}: the refresh interval must be larger than zero!",
                self.cache.name
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheOptions, SelfRefreshingCacheOptions};
    use std::time::Duration;

    #[test]
    fn default_options_are_valid() {
        assert_eq!(CacheOptions::new("test").validate().is_ok(), true);
    }

    #[test]
    fn blank_names_are_rejected() {
        assert_eq!(CacheOptions::new("").validate().is_err(), true);
        assert_eq!(CacheOptions::new("   ").validate().is_err(), true);
    }

    #[test]
    fn zero_durations_are_rejected() {
        let options = CacheOptions::new("test").with_item_expiry(Duration::ZERO);
        assert_eq!(options.validate().is_err(), true);

        let options = CacheOptions::new("test").with_flush_interval(Duration::ZERO);
        assert_eq!(options.validate().is_err(), true);
    }

    #[test]
    fn excessive_jitter_is_rejected() {
        let options = CacheOptions::new("test").with_expiry_randomization_percent(101);
        assert_eq!(options.validate().is_err(), true);

        let options = CacheOptions::new("test").with_expiry_randomization_percent(100);
        assert_eq!(options.validate().is_ok(), true);
    }

    #[test]
    fn the_jitter_window_is_derived_from_the_expiry() {
        let options = CacheOptions::new("test")
            .with_item_expiry(Duration::from_secs(100))
            .with_expiry_randomization_percent(10);
        assert_eq!(options.jitter_window(), Duration::from_secs(10));

        let options = options.with_expiry_randomization_percent(0);
        assert_eq!(options.jitter_window(), Duration::ZERO);
    }

    #[test]
    fn refresh_options_require_a_positive_interval() {
        let options =
            SelfRefreshingCacheOptions::new(CacheOptions::new("test"), Duration::ZERO);
        assert_eq!(options.validate().is_err(), true);

        let options =
            SelfRefreshingCacheOptions::new(CacheOptions::new("test"), Duration::from_secs(1));
        assert_eq!(options.validate().is_ok(), true);
    }
}
