//! Provides the record which is stored per cached key.
//!
//! A [CacheEntry](CacheEntry) combines the cached value with the two
//! timestamps the cache keeps per key: the instant the value was loaded
//! (which drives expiry) and the instant it was last read (which breaks ties
//! when the sweep trims an oversized cache). Both timestamps are owned by the
//! backing store - the in-memory store maintains them authoritatively, the
//! remote store reconstructs them on a best-effort basis.
#[cfg(test)]
pub(crate) use mock_instant::Instant;
#[cfg(not(test))]
pub(crate) use std::time::Instant;

use std::time::Duration;

/// A cached value along with its bookkeeping timestamps.
///
/// Entries are created by the backing store on a successful load or an
/// explicit put, mutated on reads (last-access) and expiry resets and
/// destroyed by invalidation, the sweep or a cache shutdown.
///
/// # Example
/// ```
/// # use std::time::Duration;
/// # use recache::entry::CacheEntry;
/// let entry = CacheEntry::new(42);
///
/// // A freshly created entry is fresh for any reasonable expiry...
/// assert_eq!(entry.is_fresh(Duration::from_secs(60)), true);
/// assert_eq!(*entry.value(), 42);
/// ```
#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    value: V,
    time_loaded: Instant,
    time_last_accessed: Instant,
}

impl<V> CacheEntry<V> {
    /// Creates an entry for a value which has been loaded just now.
    pub fn new(value: V) -> Self {
        let now = Instant::now();
        CacheEntry {
            value,
            time_loaded: now,
            time_last_accessed: now,
        }
    }

    /// Creates an entry for a value which was loaded the given amount of time
    /// ago.
    ///
    /// This is used by remote stores which persist the load timestamp as wall
    /// clock time and have to map it back onto the monotonic clock. If the
    /// age exceeds the lifetime of the process, the load time is clamped to
    /// "just now" - remote timestamps are best-effort by contract.
    pub fn with_age(value: V, age: Duration) -> Self {
        let now = Instant::now();
        CacheEntry {
            value,
            time_loaded: now.checked_sub(age).unwrap_or(now),
            time_last_accessed: now,
        }
    }

    /// Provides access to the cached value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Unwraps the entry into the cached value.
    pub fn into_value(self) -> V {
        self.value
    }

    /// Returns the instant the value of this entry was loaded.
    pub fn time_loaded(&self) -> Instant {
        self.time_loaded
    }

    /// Returns the instant this entry was last successfully read.
    pub fn time_last_accessed(&self) -> Instant {
        self.time_last_accessed
    }

    /// Determines if this entry is still fresh when entries expire after the
    /// given duration.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.time_loaded.elapsed() < max_age
    }

    /// Restarts the freshness clock of this entry as if the value had been
    /// loaded just now.
    pub fn reset_expiry(&mut self) {
        self.time_loaded = Instant::now();
    }

    /// Records a successful read.
    pub(crate) fn touch(&mut self) {
        self.time_last_accessed = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::CacheEntry;
    use crate::test_support::clock_lock;
    use mock_instant::MockClock;
    use std::time::Duration;

    #[test]
    fn fresh_entries_expire_over_time() {
        let _guard = clock_lock();

        let entry = CacheEntry::new("payload");
        assert_eq!(entry.is_fresh(Duration::from_secs(10)), true);

        MockClock::advance(Duration::from_secs(11));
        assert_eq!(entry.is_fresh(Duration::from_secs(10)), false);
    }

    #[test]
    fn resetting_the_expiry_restores_freshness() {
        let _guard = clock_lock();

        let mut entry = CacheEntry::new("payload");
        MockClock::advance(Duration::from_secs(11));
        assert_eq!(entry.is_fresh(Duration::from_secs(10)), false);

        entry.reset_expiry();
        assert_eq!(entry.is_fresh(Duration::from_secs(10)), true);
    }

    #[test]
    fn touching_moves_the_last_access_forward() {
        let _guard = clock_lock();

        let mut entry = CacheEntry::new("payload");
        let initial_access = entry.time_last_accessed();

        MockClock::advance(Duration::from_secs(1));
        entry.touch();
        assert_eq!(entry.time_last_accessed() > initial_access, true);
        // Touching must not interfere with the freshness clock...
        assert_eq!(entry.time_loaded() < entry.time_last_accessed(), true);
    }

    #[test]
    fn entries_reconstructed_from_an_age_carry_their_staleness() {
        let _guard = clock_lock();

        // Give the mocked clock some room so that the age can be subtracted...
        MockClock::advance(Duration::from_secs(3600));

        let entry = CacheEntry::with_age("payload", Duration::from_secs(120));
        assert_eq!(entry.is_fresh(Duration::from_secs(60)), false);
        assert_eq!(entry.is_fresh(Duration::from_secs(300)), true);
    }
}
