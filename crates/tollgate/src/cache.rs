// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tick::Clock;

/// A bounded, time-limited map that evicts the least recently used entry on overflow.
///
/// Both [`get`][Self::get] and [`put`][Self::put] refresh an entry's recency, so a key that
/// keeps being requested survives a flood of one-off insertions. Expiry is lazy: an entry
/// older than the TTL is treated as absent and dropped on its next lookup, but it occupies
/// a slot until then.
///
/// All operations take a single internal lock, so the cache can be shared between callers.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use tick::Clock;
/// use tollgate::Cache;
///
/// let cache = Cache::new(2, Duration::from_secs(60), &Clock::new_frozen());
///
/// cache.put("a", 1);
/// cache.put("b", 2);
/// assert_eq!(cache.get(&"a"), Some(1));
///
/// // "b" is now the least recently used entry.
/// cache.put("c", 3);
/// assert_eq!(cache.get(&"b"), None);
/// assert_eq!(cache.len(), 2);
/// ```
#[derive(Debug)]
pub struct Cache<K, V> {
    state: Mutex<CacheState<K, V>>,
    max_size: usize,
    ttl: Duration,
    clock: Clock,
}

#[derive(Debug)]
struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    // Recency stamp -> key; the first entry is the least recently used one.
    recency: BTreeMap<u64, K>,
    next_stamp: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    stamp: u64,
}

/// Point-in-time counters of a [`Cache`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[non_exhaustive]
pub struct CacheStats {
    /// Entries currently held, including expired entries not looked up since expiring.
    pub size: usize,
    /// Maximum number of entries.
    pub max_size: usize,
    /// Lookups that returned a value.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// `hits / (hits + misses)`, or zero before the first lookup.
    pub hit_rate: f64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty cache holding at most `max_size` entries for up to `ttl` each.
    ///
    /// A `max_size` of zero is treated as one.
    #[must_use]
    pub fn new(max_size: usize, ttl: Duration, clock: &Clock) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_stamp: 0,
                hits: 0,
                misses: 0,
            }),
            max_size: max_size.max(1),
            ttl,
            clock: clock.clone(),
        }
    }

    /// Returns the value stored under `key` and marks it most recently used.
    ///
    /// Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let now = self.clock.instant();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let fresh = state
            .entries
            .get(key)
            .map(|entry| now.saturating_duration_since(entry.inserted_at) <= self.ttl);

        match fresh {
            Some(true) => {}
            Some(false) => {
                state.remove(key);
                state.misses += 1;
                return None;
            }
            None => {
                state.misses += 1;
                return None;
            }
        }

        state.hits += 1;
        let stamp = state.take_stamp();
        let entry = state.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.stamp, stamp);
        state.recency.remove(&previous);
        state.recency.insert(stamp, key.clone());

        Some(entry.value.clone())
    }

    /// Inserts or replaces the value stored under `key`.
    ///
    /// The entry becomes the most recently used one with a fresh timestamp. If the cache
    /// grows past its maximum size, the least recently used entry is evicted.
    pub fn put(&self, key: K, value: V) {
        let inserted_at = self.clock.instant();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let stamp = state.take_stamp();
        state.recency.insert(stamp, key.clone());
        let previous = state.entries.insert(key, Entry { value, inserted_at, stamp });

        if let Some(previous) = previous {
            state.recency.remove(&previous.stamp);
        }

        if state.entries.len() > self.max_size {
            if let Some((_, oldest)) = state.recency.pop_first() {
                state.entries.remove(&oldest);
            }
        }
    }

    /// Removes the entry stored under `key`, returning whether one existed.
    pub fn invalidate(&self, key: &K) -> bool {
        self.state.lock().remove(key)
    }

    /// Returns whether a fresh entry exists under `key`.
    ///
    /// Unlike [`get`][Self::get], this neither refreshes recency nor updates the counters.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        let now = self.clock.instant();

        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| now.saturating_duration_since(entry.inserted_at) <= self.ttl)
    }

    /// Removes all entries and resets the hit and miss counters.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
        state.hits = 0;
        state.misses = 0;
    }

    /// Returns the number of entries held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximum number of entries.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns how long an entry stays fresh.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;

        #[expect(clippy::cast_precision_loss, reason = "counters stay far below 2^52")]
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            state.hits as f64 / lookups as f64
        };

        CacheStats {
            size: state.entries.len(),
            max_size: self.max_size,
            hits: state.hits,
            misses: state.misses,
            hit_rate,
        }
    }
}

impl<K: Eq + Hash, V> CacheState<K, V> {
    fn take_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.stamp);
                true
            }
            None => false,
        }
    }
}
