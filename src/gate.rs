//! Provides the per-key gates which serialize concurrent loads.
//!
//! The registry maps each key to a mutex token. A caller which misses the
//! cache has to acquire the gate of its key before it may invoke the loader,
//! which bounds the number of in-flight loads per key to one. How long a
//! caller waits for a gate which is already held is governed by the circuit
//! breaker timeout of the cache.
//!
//! The registry hands out clones of the gate and never holds its own internal
//! locks across an await point - a gate which is removed from the registry
//! may therefore still be held by a caller until it is released.
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Maps keys to their serialization gates.
pub(crate) struct GateRegistry<K> {
    gates: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> GateRegistry<K>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        GateRegistry {
            gates: DashMap::new(),
        }
    }

    /// Fetches the gate for the given key, creating it if required.
    ///
    /// Get-or-create is atomic via the entry API of the underlying map, so
    /// there is never more than one gate per key in the registry. The gate is
    /// cloned out immediately - the internal map lock is released before the
    /// caller attempts to acquire the gate itself.
    pub(crate) fn ensure_gate(&self, key: &K) -> Arc<Mutex<()>> {
        self.gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Removes the gate of the given key if nobody is using it.
    ///
    /// The gate is only removed while the registry holds the sole reference
    /// and its mutex is free. Both checks happen under the internal map lock,
    /// which excludes [ensure_gate](GateRegistry::ensure_gate) handing out a
    /// clone concurrently - a caller can therefore never lose a gate it
    /// already obtained.
    pub(crate) fn remove_idle_gate(&self, key: &K) {
        let _ = self
            .gates
            .remove_if(key, |_, gate| {
                Arc::strong_count(gate) == 1 && gate.try_lock().is_ok()
            });
    }

    /// Removes all gates, e.g. when the owning cache shuts down.
    pub(crate) fn drain(&self) {
        self.gates.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.gates.len()
    }
}

/// Acquires the given gate, waiting at most for the given timeout.
///
/// A timeout of `None` waits indefinitely. A timeout of zero never waits: the
/// gate is either free and acquired immediately or the acquisition fails
/// right away.
pub(crate) async fn acquire_gate(
    gate: Arc<Mutex<()>>,
    timeout: Option<Duration>,
) -> Option<OwnedMutexGuard<()>> {
    match timeout {
        None => Some(gate.lock_owned().await),
        Some(limit) if limit.is_zero() => gate.try_lock_owned().ok(),
        Some(limit) => tokio::time::timeout(limit, gate.lock_owned()).await.ok(),
    }
}
