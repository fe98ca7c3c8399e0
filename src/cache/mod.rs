//! Bounded cache that outlives its source.
//!
//! Summary tables polled by the statement collectors may be truncated by the
//! server between polls. [`RetainingCache`] keeps the previous snapshot around
//! for `retain` so per-interval deltas can still be computed, while
//! `size_limit` bounds memory when the source produces many distinct keys.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;

use crate::clock::{Clock, SystemClock};

/// Cumulative cache counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently held.
    pub current: usize,
    /// Upserts of keys that were not present.
    pub added: u64,
    /// Upserts of keys that were already present.
    pub updated: u64,
    /// Entries evicted by age or size.
    pub removed: u64,
    /// Oldest entry timestamp, if any.
    pub oldest: Option<SystemTime>,
    /// Newest entry timestamp, if any.
    pub newest: Option<SystemTime>,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "current={} added={} updated={} removed={} oldest={} newest={}",
            self.current,
            self.added,
            self.updated,
            self.removed,
            format_ts(self.oldest),
            format_ts(self.newest),
        )
    }
}

fn format_ts(ts: Option<SystemTime>) -> String {
    match ts {
        Some(ts) => DateTime::<Utc>::from(ts).to_rfc3339_opts(SecondsFormat::Secs, true),
        None => "-".to_string(),
    }
}

struct Entry<V> {
    value: V,
    refreshed_at: SystemTime,
}

struct Inner<K, V> {
    items: HashMap<K, Entry<V>>,
    added: u64,
    updated: u64,
    removed: u64,
}

/// Generic key/value cache with age- and size-based eviction.
///
/// Readers take a shared lock and receive copies, so a concurrent
/// [`refresh`](Self::refresh) is never observed half-applied.
pub struct RetainingCache<K, V> {
    retain: Duration,
    size_limit: usize,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner<K, V>>,
}

impl<K, V> RetainingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache using the system clock.
    pub fn new(retain: Duration, size_limit: usize) -> Self {
        Self::with_clock(retain, size_limit, Arc::new(SystemClock))
    }

    /// Creates an empty cache with an explicit time source.
    pub fn with_clock(retain: Duration, size_limit: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            retain,
            size_limit,
            clock,
            inner: RwLock::new(Inner {
                items: HashMap::new(),
                added: 0,
                updated: 0,
                removed: 0,
            }),
        }
    }

    /// Returns a copy of every live entry.
    pub fn get(&self) -> HashMap<K, V> {
        let inner = self.inner.read();
        inner
            .items
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Expires old entries, merges `current`, then trims to the size limit.
    ///
    /// Expiry runs before the merge, so an entry older than `retain` is
    /// dropped even if `current` re-adds the same key (it is then counted as
    /// added, not updated).
    pub fn refresh(&self, current: HashMap<K, V>) {
        let now = self.clock.now();
        let mut inner = self.inner.write();

        let retain = self.retain;
        let before = inner.items.len();
        inner.items.retain(|_, e| {
            let age = now.duration_since(e.refreshed_at).unwrap_or(Duration::ZERO);
            age < retain
        });
        let expired = (before - inner.items.len()) as u64;
        inner.removed += expired;

        for (k, value) in current {
            let entry = Entry {
                value,
                refreshed_at: now,
            };
            if inner.items.insert(k, entry).is_some() {
                inner.updated += 1;
            } else {
                inner.added += 1;
            }
        }

        if inner.items.len() > self.size_limit {
            let excess = inner.items.len() - self.size_limit;
            let mut by_age: Vec<(SystemTime, K)> = inner
                .items
                .iter()
                .map(|(k, e)| (e.refreshed_at, k.clone()))
                .collect();
            by_age.sort_unstable_by_key(|(ts, _)| *ts);

            for (_, k) in by_age.into_iter().take(excess) {
                inner.items.remove(&k);
            }
            inner.removed += excess as u64;
        }
    }

    /// Returns cumulative counters and the current age span.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let mut oldest: Option<SystemTime> = None;
        let mut newest: Option<SystemTime> = None;

        for e in inner.items.values() {
            let ts = e.refreshed_at;
            if oldest.map_or(true, |o| ts < o) {
                oldest = Some(ts);
            }
            if newest.map_or(true, |n| ts > n) {
                newest = Some(ts);
            }
        }

        CacheStats {
            current: inner.items.len(),
            added: inner.added,
            updated: inner.updated,
            removed: inner.removed,
            oldest,
            newest,
        }
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> fmt::Debug for RetainingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetainingCache")
            .field("retain", &self.retain)
            .field("size_limit", &self.size_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::clock::ManualClock;

    fn snapshot(keys: &[u32], value: u64) -> HashMap<u32, u64> {
        keys.iter().map(|k| (*k, value)).collect()
    }

    fn test_cache(retain: Duration, size_limit: usize) -> (RetainingCache<u32, u64>, ManualClock) {
        let clock = ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let cache = RetainingCache::with_clock(retain, size_limit, Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn test_get_before_refresh_is_empty() {
        let (cache, _clock) = test_cache(Duration::from_secs(60), 10);
        assert!(cache.get().is_empty());
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn test_refresh_counts_adds_and_updates() {
        let (cache, clock) = test_cache(Duration::from_secs(60), 10);

        cache.refresh(snapshot(&[1, 2, 3], 10));
        clock.advance(Duration::from_secs(1));
        cache.refresh(snapshot(&[2, 3, 4], 20));

        let stats = cache.stats();
        assert_eq!(stats.current, 4);
        assert_eq!(stats.added, 4);
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.removed, 0);

        let items = cache.get();
        assert_eq!(items.get(&1), Some(&10));
        assert_eq!(items.get(&2), Some(&20));
        assert_eq!(items.get(&4), Some(&20));
    }

    #[test]
    fn test_refresh_expires_before_merge() {
        let (cache, clock) = test_cache(Duration::from_secs(60), 100);

        cache.refresh(snapshot(&[1, 2, 3, 4, 5], 1));
        clock.advance(Duration::from_secs(61));
        cache.refresh(snapshot(&[2, 3, 4, 5, 6], 2));

        let stats = cache.stats();
        assert_eq!(stats.removed, 5);
        assert_eq!(stats.added, 10);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.current, 5);
        assert!(!cache.get().contains_key(&1));
    }

    #[test]
    fn test_refresh_keeps_entries_within_retain() {
        let (cache, clock) = test_cache(Duration::from_secs(60), 100);

        cache.refresh(snapshot(&[1, 2], 1));
        clock.advance(Duration::from_secs(30));
        cache.refresh(snapshot(&[3], 1));

        let items = cache.get();
        assert_eq!(items.len(), 3);
        assert_eq!(cache.stats().removed, 0);
    }

    #[test]
    fn test_zero_retain_expires_on_next_refresh() {
        let (cache, _clock) = test_cache(Duration::ZERO, 100);

        cache.refresh(snapshot(&[1, 2], 1));
        assert_eq!(cache.len(), 2);

        cache.refresh(HashMap::new());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().removed, 2);
    }

    #[test]
    fn test_size_limit_evicts_oldest_first() {
        let (cache, clock) = test_cache(Duration::from_secs(3600), 3);

        cache.refresh(snapshot(&[1, 2], 1));
        clock.advance(Duration::from_secs(1));
        cache.refresh(snapshot(&[3], 1));
        clock.advance(Duration::from_secs(1));
        cache.refresh(snapshot(&[4], 1));

        let items = cache.get();
        assert_eq!(items.len(), 3);
        assert!(items.contains_key(&3));
        assert!(items.contains_key(&4));
        assert_eq!(cache.stats().removed, 1);
    }

    #[test]
    fn test_refreshed_key_survives_size_trim() {
        let (cache, clock) = test_cache(Duration::from_secs(3600), 2);

        cache.refresh(snapshot(&[1, 2], 1));
        clock.advance(Duration::from_secs(1));
        // Key 1 is refreshed, so key 2 becomes the oldest.
        cache.refresh(snapshot(&[1, 3], 1));

        let items = cache.get();
        assert_eq!(items.len(), 2);
        assert!(items.contains_key(&1));
        assert!(items.contains_key(&3));
    }

    #[test]
    fn test_zero_size_limit_evicts_everything() {
        let (cache, _clock) = test_cache(Duration::from_secs(60), 0);

        cache.refresh(snapshot(&[1, 2, 3], 1));
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.added, 3);
        assert_eq!(stats.removed, 3);
    }

    #[test]
    fn test_age_expiry_applies_before_size_trim() {
        let (cache, clock) = test_cache(Duration::from_secs(10), 2);

        cache.refresh(snapshot(&[1, 2], 1));
        clock.advance(Duration::from_secs(11));
        cache.refresh(snapshot(&[3, 4], 1));

        // Both old entries expired by age; the new ones fit the limit.
        let stats = cache.stats();
        assert_eq!(stats.current, 2);
        assert_eq!(stats.removed, 2);
        let items = cache.get();
        assert!(items.contains_key(&3));
        assert!(items.contains_key(&4));
    }

    #[test]
    fn test_stats_timestamps() {
        let (cache, clock) = test_cache(Duration::from_secs(3600), 10);
        let t0 = clock.now();

        cache.refresh(snapshot(&[1], 1));
        clock.advance(Duration::from_secs(5));
        cache.refresh(snapshot(&[2], 1));

        let stats = cache.stats();
        assert_eq!(stats.oldest, Some(t0));
        assert_eq!(stats.newest, Some(t0 + Duration::from_secs(5)));

        let text = stats.to_string();
        assert!(text.contains("current=2"));
        assert!(text.contains("oldest=2023-11-14T22:13:20Z"));
    }

    #[test]
    fn test_get_returns_independent_copy() {
        let (cache, _clock) = test_cache(Duration::from_secs(60), 10);
        cache.refresh(snapshot(&[1], 1));

        let mut copy = cache.get();
        copy.insert(9, 9);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_get_and_refresh() {
        use std::thread;

        let cache = Arc::new(RetainingCache::<u32, u64>::new(Duration::from_secs(60), 64));
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for i in 0..200u32 {
                    if t % 2 == 0 {
                        cache.refresh(snapshot(&[t * 1000 + i], u64::from(i)));
                    } else {
                        let items = cache.get();
                        assert!(items.len() <= 64);
                    }
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        assert!(cache.len() <= 64);
    }
}
