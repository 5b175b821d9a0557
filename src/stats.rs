//! Provides lock-free runtime metrics for a cache.
//!
//! A healthy cache serves the vast majority of its reads from memory. The
//! counters collected here make this observable without adding any
//! synchronization to the hot path - everything is recorded via relaxed
//! atomic increments and read as a point-in-time [CacheStats](CacheStats)
//! snapshot.
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

/// Collects the live counters of a cache.
///
/// Internally mutable without a mutable reference as all counters rely on
/// atomic intrinsics.
#[derive(Default)]
pub(crate) struct StatsCounters {
    reads: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    flushes: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_read(&self) {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        let _ = self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        let _ = self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self) {
        let _ = self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        let _ = self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load_failure(&self) {
        let _ = self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_breaker_trip(&self) {
        let _ = self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        let _ = self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        let _ = self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of the metrics of a cache.
///
/// Obtained via [Cache::stats](crate::cache::Cache::stats). As the counters
/// are recorded with relaxed ordering, numbers taken under heavy concurrent
/// load are approximations.
///
/// # Example
/// ```
/// # use recache::stats::CacheStats;
/// let stats = CacheStats {
///     reads: 10,
///     hits: 8,
///     ..CacheStats::default()
/// };
///
/// assert_eq!(stats.hit_rate().round() as i32, 80);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of read operations (both plain lookups and read-through calls).
    pub reads: u64,
    /// Number of reads which were answered with a fresh entry.
    pub hits: u64,
    /// Number of reads which found no fresh entry.
    pub misses: u64,
    /// Number of explicit writes via `try_add`.
    pub writes: u64,
    /// Number of completed loader invocations.
    pub loads: u64,
    /// Number of loader invocations which failed.
    pub load_failures: u64,
    /// Number of callers which gave up waiting on a key gate.
    pub circuit_breaker_trips: u64,
    /// Number of sweep runs.
    pub flushes: u64,
    /// Number of entries removed by sweeps, invalidations and replacements.
    pub evictions: u64,
}

impl CacheStats {
    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            reads => self.hits as f32 / reads as f32 * 100.,
        }
    }
}

impl Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reads, {} hits ({:.1} %), {} loads, {} evictions",
            self.reads,
            self.hits,
            self.hit_rate(),
            self.loads,
            self.evictions
        )
    }
}
