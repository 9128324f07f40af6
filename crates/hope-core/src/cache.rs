//! Bounded cache abstraction.
//!
//! A capacity-bounded, access-expiring cache behind the [`BoundedCache`]
//! trait. The default implementation, [`TtlLruCache`], layers an
//! expire-after-access policy on top of an LRU and reports every removal
//! to an optional eviction hook.
//!
//! ```text
//!   insert ──► full? ──► purge expired ──► still full? ──► evict LRU (Capacity)
//!   get    ──► idle ≥ ttl? ──► remove (Expired) : touch + move to MRU
//! ```

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::Serialize;

use crate::clock::SharedClock;

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionCause {
    /// Pushed out by a newer entry at capacity
    Capacity,
    /// Idle longer than the time-to-live
    Expired,
    /// Removed by `invalidate`
    Explicit,
}

/// Callback invoked after an entry is removed.
pub type EvictionHook<K, V> = Arc<dyn Fn(&K, &V, EvictionCause) + Send + Sync>;

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0 when nothing was looked up
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// A capacity- and time-bounded key/value cache.
pub trait BoundedCache<K, V>: Send + Sync {
    /// Look up a live entry, refreshing its access time.
    fn get(&self, key: &K) -> Option<V>;

    /// Atomically fetch the entry (creating it with `init` if absent or
    /// expired) and apply `update` to it while the cache is locked.
    fn upsert_with<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&mut V) -> R,
    ) -> R;

    /// Atomically fetch or create an entry, returning a copy.
    fn get_or_insert_with(&self, key: K, init: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        self.upsert_with(key, init, |value| value.clone())
    }

    /// Insert or replace an entry.
    fn insert(&self, key: K, value: V);

    /// Remove an entry; returns whether it was present.
    fn invalidate(&self, key: &K) -> bool;

    /// Drop every expired entry; returns how many were removed.
    fn purge_expired(&self) -> usize;

    /// Number of stored entries (expired entries may be counted until purged).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> CacheStats;
}

struct Slot<V> {
    value: V,
    last_access: DateTime<Utc>,
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, Slot<V>>,
    stats: CacheStats,
}

/// LRU cache with expire-after-access semantics.
pub struct TtlLruCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    ttl: Duration,
    clock: SharedClock,
    on_evict: Option<EvictionHook<K, V>>,
}

impl<K, V> TtlLruCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Send,
{
    /// Create a cache holding at most `capacity` entries, each expiring
    /// after `ttl` without access.
    pub fn new(capacity: usize, ttl: Duration, clock: SharedClock) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                stats: CacheStats::default(),
            }),
            ttl,
            clock,
            on_evict: None,
        }
    }

    /// Register a callback for removals.
    pub fn with_eviction_hook(mut self, hook: EvictionHook<K, V>) -> Self {
        self.on_evict = Some(hook);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, slot: &Slot<V>, now: DateTime<Utc>) -> bool {
        now - slot.last_access >= self.ttl
    }

    fn drain_expired(&self, inner: &mut Inner<K, V>, now: DateTime<Utc>) -> Vec<(K, V, EvictionCause)> {
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, slot)| self.is_expired(slot, now))
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                inner
                    .entries
                    .pop(&key)
                    .map(|slot| (key, slot.value, EvictionCause::Expired))
            })
            .collect()
    }

    /// Make room for one new key, returning whatever had to go.
    fn make_room(&self, inner: &mut Inner<K, V>, now: DateTime<Utc>) -> Vec<(K, V, EvictionCause)> {
        if inner.entries.len() < inner.entries.cap().get() {
            return Vec::new();
        }
        let mut removed = self.drain_expired(inner, now);
        if inner.entries.len() >= inner.entries.cap().get() {
            if let Some((key, slot)) = inner.entries.pop_lru() {
                removed.push((key, slot.value, EvictionCause::Capacity));
            }
        }
        removed
    }

    /// Run the hook outside the lock so it may call back into the cache.
    fn notify(&self, removed: Vec<(K, V, EvictionCause)>) {
        if let Some(hook) = &self.on_evict {
            for (key, value, cause) in &removed {
                hook(key, value, *cause);
            }
        }
    }
}

impl<K, V> BoundedCache<K, V> for TtlLruCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut removed = Vec::new();
        let result = {
            let mut inner = self.lock();
            let expired = matches!(inner.entries.peek(key), Some(slot) if self.is_expired(slot, now));
            if expired {
                if let Some(slot) = inner.entries.pop(key) {
                    removed.push((key.clone(), slot.value, EvictionCause::Expired));
                }
                inner.stats.evictions += 1;
            }
            match inner.entries.get_mut(key) {
                Some(slot) => {
                    slot.last_access = now;
                    let value = slot.value.clone();
                    inner.stats.hits += 1;
                    Some(value)
                }
                None => {
                    inner.stats.misses += 1;
                    None
                }
            }
        };
        self.notify(removed);
        result
    }

    fn upsert_with<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        update: impl FnOnce(&mut V) -> R,
    ) -> R {
        let now = self.clock.now();
        let mut removed = Vec::new();
        let result = {
            let mut inner = self.lock();
            let expired = matches!(inner.entries.peek(&key), Some(slot) if self.is_expired(slot, now));
            if expired {
                if let Some(slot) = inner.entries.pop(&key) {
                    removed.push((key.clone(), slot.value, EvictionCause::Expired));
                }
            }
            if inner.entries.contains(&key) {
                inner.stats.hits += 1;
            } else {
                inner.stats.misses += 1;
                removed.extend(self.make_room(&mut inner, now));
            }
            inner.stats.evictions += removed.len() as u64;
            let slot = inner.entries.get_or_insert_mut(key, || Slot {
                value: init(),
                last_access: now,
            });
            slot.last_access = now;
            update(&mut slot.value)
        };
        self.notify(removed);
        result
    }

    fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let removed = {
            let mut inner = self.lock();
            let removed = if inner.entries.contains(&key) {
                Vec::new()
            } else {
                self.make_room(&mut inner, now)
            };
            inner.stats.evictions += removed.len() as u64;
            inner.entries.put(
                key,
                Slot {
                    value,
                    last_access: now,
                },
            );
            removed
        };
        self.notify(removed);
    }

    fn invalidate(&self, key: &K) -> bool {
        let removed = self.lock().entries.pop(key);
        match removed {
            Some(slot) => {
                self.notify(vec![(key.clone(), slot.value, EvictionCause::Explicit)]);
                true
            }
            None => false,
        }
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = {
            let mut inner = self.lock();
            let removed = self.drain_expired(&mut inner, now);
            inner.stats.evictions += removed.len() as u64;
            removed
        };
        let count = removed.len();
        self.notify(removed);
        count
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            size: inner.entries.len(),
            ..inner.stats
        }
    }
}
