use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// A small TTL read cache with explicit invalidation.
///
/// Entries live in one map and expire lazily: an expired entry is dropped on
/// the read that finds it, or by [`TtlCache::sweep`]. Mutating paths call
/// [`TtlCache::invalidate`] so admin changes are visible immediately instead
/// of after the TTL.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheSlot<V>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheSlot<V> {
    value: V,
    expires_at: Instant,
}

/// Point-in-time cache counters for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if let Some(slot) = self.entries.get(key) {
            if Instant::now() < slot.expires_at {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(slot.value.clone());
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // Expired: drop it and report a miss.
        self.entries
            .remove_if(key, |_, slot| Instant::now() >= slot.expires_at);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            CacheSlot {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop all expired entries; returns how many were removed.
    pub fn sweep(&self) -> u64 {
        let now = Instant::now();
        let mut removed = 0u64;
        self.entries.retain(|_, slot| {
            if now >= slot.expires_at {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Live entries, for admin inspection. Skips expired-but-unswept slots.
    pub fn entries(&self) -> Vec<(K, V)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| now < entry.value().expires_at)
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.len() as u64,
        }
    }
}
