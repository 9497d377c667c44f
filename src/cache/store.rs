//! Bounded response cache storage.
//!
//! Entries expire after their TTL and are evicted when either the entry
//! count or the summed body size would exceed the configured bounds.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use metrics::{counter, gauge};
use thiserror::Error;
use tollgate_api_types::CacheStatsResponse;
use tracing::{debug, warn};

use crate::util::clock::Clock;
use crate::util::lock::{rw_read, rw_write};

use super::config::{CacheConfig, EvictionPolicy};
use super::keys::CacheKey;

const SOURCE: &str = "cache::store";
const HIT_WEIGHT_MS: i64 = 1_000;

const METRIC_CACHE_HIT_TOTAL: &str = "tollgate_cache_hit_total";
const METRIC_CACHE_MISS_TOTAL: &str = "tollgate_cache_miss_total";
const METRIC_CACHE_EVICT_TOTAL: &str = "tollgate_cache_evict_total";
const METRIC_CACHE_EXPIRED_TOTAL: &str = "tollgate_cache_expired_total";
const METRIC_CACHE_ENTRIES: &str = "tollgate_cache_entries";
const METRIC_CACHE_SIZE_BYTES: &str = "tollgate_cache_size_bytes";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds cache capacity of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },
}

/// Cached HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A served entry plus how long ago it was stored.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: CachedResponse,
    pub age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub total_size_bytes: u64,
    pub max_entries: u64,
    pub max_size_bytes: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// `hits / (hits + misses)`, zero before the first lookup.
    pub hit_rate: f64,
}

impl From<CacheStats> for CacheStatsResponse {
    fn from(stats: CacheStats) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            entries: stats.entries,
            total_size_bytes: stats.total_size_bytes,
            max_entries: stats.max_entries,
            max_size_bytes: stats.max_size_bytes,
            evictions: stats.evictions,
            expirations: stats.expirations,
            hit_rate: stats.hit_rate,
        }
    }
}

struct CacheEntry {
    response: CachedResponse,
    created_at_ms: i64,
    ttl_ms: i64,
    hit_count: u64,
    size_bytes: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.created_at_ms.saturating_add(self.ttl_ms)
    }

    fn score(&self) -> i64 {
        let bonus = i64::try_from(self.hit_count)
            .unwrap_or(i64::MAX)
            .saturating_mul(HIT_WEIGHT_MS);
        self.created_at_ms.saturating_add(bonus)
    }
}

struct Inner {
    // unbounded: bounds are enforced by `make_room`, not by the LRU itself
    entries: LruCache<CacheKey, CacheEntry>,
    total_size_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Inner {
    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.total_size_bytes = self.total_size_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<CacheKey> {
        match policy {
            EvictionPolicy::Lru => self.entries.peek_lru().map(|(key, _)| key.clone()),
            EvictionPolicy::Scored => self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.score())
                .map(|(key, _)| key.clone()),
        }
    }
}

/// Size- and count-bounded response cache with TTL expiry.
pub struct ResponseCache {
    inner: RwLock<Inner>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: LruCache::unbounded(),
                total_size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        let now_ms = self.clock.now_ms();
        let mut inner = rw_write(&self.inner, SOURCE, "get");

        let Some(expired) = inner.entries.peek(key).map(|entry| entry.is_expired(now_ms)) else {
            inner.misses += 1;
            counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
            return None;
        };

        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.misses += 1;
            counter!(METRIC_CACHE_EXPIRED_TOTAL).increment(1);
            counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
            record_size(&inner);
            return None;
        }

        inner.hits += 1;
        counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
        let entry = inner.entries.get_mut(key)?;
        entry.hit_count += 1;
        let age_ms = now_ms.saturating_sub(entry.created_at_ms).max(0);

        Some(CacheHit {
            response: entry.response.clone(),
            age: Duration::from_millis(age_ms as u64),
        })
    }

    /// Store `response` under `key`, replacing any previous entry.
    ///
    /// Returns how many other entries were evicted to make room.
    pub fn set(
        &self,
        key: CacheKey,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<usize, CacheError> {
        let size_bytes = response.body.len() as u64;
        if size_bytes > self.config.max_size_bytes {
            return Err(CacheError::EntryTooLarge {
                size: size_bytes,
                max: self.config.max_size_bytes,
            });
        }

        let now_ms = self.clock.now_ms();
        let mut inner = rw_write(&self.inner, SOURCE, "set");
        inner.remove(&key);

        let evicted = self.make_room(&mut inner, size_bytes);

        inner.entries.push(
            key,
            CacheEntry {
                response,
                created_at_ms: now_ms,
                ttl_ms: i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
                hit_count: 0,
                size_bytes,
            },
        );
        inner.total_size_bytes += size_bytes;
        record_size(&inner);

        Ok(evicted)
    }

    fn make_room(&self, inner: &mut Inner, incoming_bytes: u64) -> usize {
        let max_entries = self.config.max_entries_non_zero().get();
        let mut evicted = 0;

        while inner.entries.len() >= max_entries
            || inner.total_size_bytes + incoming_bytes > self.config.max_size_bytes
        {
            let Some(victim) = inner.victim(self.config.eviction_policy) else {
                break;
            };
            if let Some(entry) = inner.remove(&victim) {
                debug!(
                    target = "tollgate::cache",
                    key = %victim,
                    size_bytes = entry.size_bytes,
                    hits = entry.hit_count,
                    policy = self.config.eviction_policy.as_str(),
                    "evicted cache entry"
                );
            }
            inner.evictions += 1;
            evicted += 1;
        }

        if evicted > 0 {
            counter!(METRIC_CACHE_EVICT_TOTAL, "policy" => self.config.eviction_policy.as_str())
                .increment(evicted as u64);
        }
        evicted
    }

    /// Returns whether an entry was removed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut inner = rw_write(&self.inner, SOURCE, "invalidate");
        let removed = inner.remove(key).is_some();
        record_size(&inner);
        removed
    }

    /// Drop every entry; counters are kept. Returns entries removed.
    pub fn clear(&self) -> usize {
        let mut inner = rw_write(&self.inner, SOURCE, "clear");
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.total_size_bytes = 0;
        record_size(&inner);
        removed
    }

    /// Remove every entry past its TTL. Returns entries removed.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut inner = rw_write(&self.inner, SOURCE, "purge_expired");

        let expired: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        inner.expirations += expired.len() as u64;

        if !expired.is_empty() {
            counter!(METRIC_CACHE_EXPIRED_TOTAL).increment(expired.len() as u64);
            record_size(&inner);
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = rw_read(&self.inner, SOURCE, "stats");
        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            inner.hits as f64 / lookups as f64
        };

        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len() as u64,
            total_size_bytes: inner.total_size_bytes,
            max_entries: self.config.max_entries_non_zero().get() as u64,
            max_size_bytes: self.config.max_size_bytes,
            evictions: inner.evictions,
            expirations: inner.expirations,
            hit_rate,
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn hit_count(&self, key: &CacheKey) -> Option<u64> {
        rw_read(&self.inner, SOURCE, "hit_count")
            .entries
            .peek(key)
            .map(|entry| entry.hit_count)
    }
}

fn record_size(inner: &Inner) {
    gauge!(METRIC_CACHE_ENTRIES).set(inner.entries.len() as f64);
    gauge!(METRIC_CACHE_SIZE_BYTES).set(inner.total_size_bytes as f64);
}

/// Log a store failure without surfacing it to the caller.
pub(crate) fn log_store_failure(key: &CacheKey, err: &CacheError) {
    warn!(target = "tollgate::cache", key = %key, error = %err, "skipping cache store");
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::Value;

    use super::*;
    use crate::util::clock::ManualClock;

    fn key(name: &str) -> CacheKey {
        CacheKey::for_request("GET", name, &Value::Null)
    }

    fn response(body: &'static str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn cache(config: CacheConfig) -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (ResponseCache::new(config, clock.clone()), clock)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn hit_increments_stats_and_reports_age() {
        let (cache, clock) = cache(CacheConfig::default());
        assert!(cache.get(&key("/a")).is_none());

        cache.set(key("/a"), response("hello"), TTL).expect("stored");
        clock.advance(Duration::from_secs(3));

        let hit = cache.get(&key("/a")).expect("hit");
        assert_eq!(hit.response.body, Bytes::from_static(b"hello"));
        assert_eq!(hit.age, Duration::from_secs(3));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_size_bytes, 5);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn repeated_hits_return_the_same_body() {
        let (cache, _) = cache(CacheConfig::default());
        cache.set(key("/a"), response("stable"), TTL).expect("stored");

        let first = cache.get(&key("/a")).expect("hit");
        let second = cache.get(&key("/a")).expect("hit");
        assert_eq!(first.response, second.response);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn each_hit_bumps_the_entry_hit_count() {
        let (cache, _) = cache(CacheConfig::default());
        cache.set(key("/a"), response("stable"), TTL).expect("stored");
        assert_eq!(cache.hit_count(&key("/a")), Some(0));

        for _ in 0..4 {
            let hit = cache.get(&key("/a")).expect("hit");
            assert_eq!(hit.response.body, Bytes::from_static(b"stable"));
        }
        assert_eq!(cache.hit_count(&key("/a")), Some(4));

        // a miss on another key leaves it alone
        assert!(cache.get(&key("/b")).is_none());
        assert_eq!(cache.hit_count(&key("/a")), Some(4));
    }

    #[test]
    fn expired_lookup_counts_as_miss() {
        let (cache, clock) = cache(CacheConfig::default());
        cache
            .set(key("/a"), response("x"), Duration::from_millis(1_000))
            .expect("stored");

        clock.advance(Duration::from_millis(500));
        assert!(cache.get(&key("/a")).is_some());
        assert_eq!(cache.stats().misses, 0);

        clock.advance(Duration::from_millis(1_000));
        assert!(cache.get(&key("/a")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (cache, clock) = cache(CacheConfig::default());
        cache.set(key("/a"), response("x"), TTL).expect("stored");

        clock.advance(TTL);
        assert!(cache.get(&key("/a")).is_some(), "still fresh at exactly ttl");

        clock.advance(Duration::from_millis(1));
        assert!(cache.get(&key("/a")).is_none());

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size_bytes, 0);
    }

    #[test]
    fn replacing_a_key_does_not_double_count_size() {
        let (cache, _) = cache(CacheConfig::default());
        cache.set(key("/a"), response("12345"), TTL).expect("stored");
        cache.set(key("/a"), response("123"), TTL).expect("stored");

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_size_bytes, 3);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn entry_count_stays_bounded() {
        let (cache, clock) = cache(CacheConfig {
            max_entries: 3,
            ..Default::default()
        });

        for i in 0..10 {
            clock.advance(Duration::from_millis(10));
            cache
                .set(key(&format!("/{i}")), response("x"), TTL)
                .expect("stored");
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.stats().evictions, 7);
    }

    #[test]
    fn size_stays_bounded() {
        let (cache, clock) = cache(CacheConfig {
            max_size_bytes: 10,
            ..Default::default()
        });

        cache.set(key("/a"), response("1234"), TTL).expect("stored");
        clock.advance(Duration::from_millis(1));
        cache.set(key("/b"), response("1234"), TTL).expect("stored");
        clock.advance(Duration::from_millis(1));
        let evicted = cache.set(key("/c"), response("1234"), TTL).expect("stored");

        assert_eq!(evicted, 1);
        assert!(cache.stats().total_size_bytes <= 10);
        assert!(cache.get(&key("/a")).is_none());
    }

    #[test]
    fn oversized_entry_is_refused() {
        let (cache, _) = cache(CacheConfig {
            max_size_bytes: 4,
            ..Default::default()
        });
        let err = cache
            .set(key("/a"), response("too large"), TTL)
            .expect_err("refused");
        assert_eq!(err, CacheError::EntryTooLarge { size: 9, max: 4 });
        assert!(cache.is_empty());
    }

    #[test]
    fn scored_eviction_prefers_old_unpopular_entries() {
        let (cache, clock) = cache(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });

        cache.set(key("/old"), response("x"), TTL).expect("stored");
        clock.advance(Duration::from_millis(500));
        cache.set(key("/new"), response("x"), TTL).expect("stored");

        // one hit is worth a second of age
        cache.get(&key("/old"));
        clock.advance(Duration::from_millis(10));
        cache.set(key("/third"), response("x"), TTL).expect("stored");

        assert!(cache.get(&key("/old")).is_some());
        assert!(cache.get(&key("/new")).is_none());
    }

    #[test]
    fn lru_eviction_drops_least_recently_used() {
        let (cache, _) = cache(CacheConfig {
            max_entries: 2,
            eviction_policy: EvictionPolicy::Lru,
            ..Default::default()
        });

        cache.set(key("/a"), response("x"), TTL).expect("stored");
        cache.set(key("/b"), response("x"), TTL).expect("stored");
        cache.get(&key("/a"));
        cache.set(key("/c"), response("x"), TTL).expect("stored");

        assert!(cache.get(&key("/a")).is_some());
        assert!(cache.get(&key("/b")).is_none());
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let (cache, clock) = cache(CacheConfig::default());
        cache
            .set(key("/short"), response("x"), Duration::from_secs(1))
            .expect("stored");
        cache.set(key("/long"), response("y"), TTL).expect("stored");

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn invalidate_and_clear() {
        let (cache, _) = cache(CacheConfig::default());
        cache.set(key("/a"), response("x"), TTL).expect("stored");
        cache.set(key("/b"), response("y"), TTL).expect("stored");

        assert!(cache.invalidate(&key("/a")));
        assert!(!cache.invalidate(&key("/a")));
        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.stats().total_size_bytes, 0);
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let (cache, _) = cache(CacheConfig::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = cache.inner.write().expect("lock should be acquired");
            panic!("poison cache lock");
        }));

        cache.set(key("/a"), response("x"), TTL).expect("stored");
        assert!(cache.get(&key("/a")).is_some());
    }
}
