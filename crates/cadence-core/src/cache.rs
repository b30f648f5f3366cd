//! Short-lived read-through cache for iteration and state records.
//!
//! A cascade chain looks up the same iteration and the same handful of states
//! over and over (the item, its parent, each child). [`LookupCache`] keeps
//! those records for a fixed TTL so one chain issues each lookup once.
//!
//! The cache owns its locking: callers may share one instance across threads
//! without serializing externally. A miss calls the supplied loader *outside*
//! the lock, so two concurrent misses on the same key may both load; the
//! second insert simply refreshes the entry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{CacheError, StoreError};
use crate::model::{Iteration, IterationId, State, StateId};

/// Default time-to-live for cached records.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Hit/miss counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Mutex-guarded map with a fixed time-to-live per entry.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Copy,
    V: Clone,
{
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh(&self, key: &K) -> Option<V> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Return the cached value, or load, store and return it.
    ///
    /// # Errors
    ///
    /// Returns the loader's error unchanged; nothing is cached in that case.
    pub fn get_or_load<E>(&self, key: K, load: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(value) = self.fresh(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = load()?;
        self.entries().insert(
            key,
            Entry {
                value: value.clone(),
                stored_at: Instant::now(),
            },
        );
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) {
        self.entries().remove(key);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Iteration and state lookups shared by one engine.
#[derive(Debug)]
pub struct LookupCache {
    iterations: TtlCache<IterationId, Iteration>,
    states: TtlCache<StateId, State>,
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl LookupCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            iterations: TtlCache::new(ttl),
            states: TtlCache::new(ttl),
        }
    }

    /// Look up an iteration. Ids `<= 0` mean "backlog" and yield `None`
    /// without calling the loader.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::LookupFailed`] when the loader fails.
    pub fn get_iteration(
        &self,
        id: IterationId,
        load: impl FnOnce(IterationId) -> Result<Iteration, StoreError>,
    ) -> Result<Option<Iteration>, CacheError> {
        let Some(id) = id.assigned() else {
            return Ok(None);
        };
        let iteration = self.iterations.get_or_load(id, || {
            tracing::debug!(%id, "iteration cache miss");
            load(id).map_err(|source| CacheError::LookupFailed {
                kind: "iteration",
                id: id.get(),
                source,
            })
        })?;
        Ok(Some(iteration))
    }

    /// Look up a state. States are never optional: ids `<= 0` are an error.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidId`] for non-positive ids and
    /// [`CacheError::LookupFailed`] when the loader fails.
    pub fn get_state(
        &self,
        id: StateId,
        load: impl FnOnce(StateId) -> Result<State, StoreError>,
    ) -> Result<State, CacheError> {
        if id.get() <= 0 {
            return Err(CacheError::InvalidId {
                kind: "state",
                id: id.get(),
            });
        }
        self.states.get_or_load(id, || {
            tracing::debug!(%id, "state cache miss");
            load(id).map_err(|source| CacheError::LookupFailed {
                kind: "state",
                id: id.get(),
                source,
            })
        })
    }

    pub fn invalidate_iteration(&self, id: IterationId) {
        self.iterations.invalidate(&id);
    }

    pub fn invalidate_state(&self, id: StateId) {
        self.states.invalidate(&id);
    }

    pub fn clear(&self) {
        self.iterations.clear();
        self.states.clear();
    }

    /// Combined counters of both maps.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let a = self.iterations.stats();
        let b = self.states.stats();
        CacheStats {
            hits: a.hits + b.hits,
            misses: a.misses + b.misses,
        }
    }
}
