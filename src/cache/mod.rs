//! In-memory response cache with TTL expiry and bounded size.
//!
//! Entries are evicted lazily when an expired entry is touched by [`Cache::get`]
//! or [`Cache::has`], and in bulk by [`Cache::cleanup`]. When the cache is full,
//! the entry created earliest is evicted, regardless of how often it was read.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::{SdkError, SdkResult};

/// Default time-to-live for cached entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default maximum number of cached entries.
pub const DEFAULT_CACHE_MAX_SIZE: usize = 100;

/// Configuration for the response cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether caching is enabled. A disabled cache is a no-op.
    pub enabled: bool,
    /// Default time-to-live for entries.
    pub ttl: Duration,
    /// Maximum number of entries.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: DEFAULT_CACHE_TTL,
            max_size: DEFAULT_CACHE_MAX_SIZE,
        }
    }
}

impl CacheConfig {
    /// Creates an enabled cache configuration with the given TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Creates a disabled cache configuration.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Sets the maximum number of entries.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SdkResult<()> {
        if self.enabled && self.max_size == 0 {
            return Err(SdkError::configuration("Cache max_size must be at least 1"));
        }
        Ok(())
    }
}

/// A single cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    /// When the entry was inserted.
    pub created_at: Instant,
    /// When the entry stops being served.
    pub expires_at: Instant,
    /// Number of times the entry was served.
    pub hits: u64,
    /// Insertion order; breaks ties between entries created at the same instant.
    sequence: u64,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration, sequence: u64) -> Self {
        let created_at = Instant::now();
        Self {
            value,
            created_at,
            expires_at: created_at + ttl,
            hits: 0,
            sequence,
        }
    }

    fn creation_order(&self) -> (Instant, u64) {
        (self.created_at, self.sequence)
    }

    /// Returns true once `now` is past the expiry instant.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Per-entry statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryStats {
    /// Entry key.
    pub key: String,
    /// Time since the entry was created.
    pub age: Duration,
    /// Time until the entry expires.
    pub ttl_remaining: Duration,
    /// Number of times the entry was served.
    pub hits: u64,
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of stored entries, including ones expired but not yet swept.
    pub size: usize,
    /// Configured maximum size.
    pub max_size: usize,
    /// Total lookups served from the cache.
    pub hits: u64,
    /// Total lookups that missed.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 when there were no lookups.
    pub hit_rate: f64,
    /// Per-entry details, ordered by creation time.
    pub entries: Vec<CacheEntryStats>,
}

/// TTL-bounded key/value cache.
pub struct Cache<V> {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    next_sequence: AtomicU64,
}

impl<V: Clone> Cache<V> {
    /// Creates a new cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns true if the cache is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Returns the value for `key` if present and unexpired.
    ///
    /// An expired entry is removed on access.
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hits += 1;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.remove(key);
            debug!(key, "Evicted expired cache entry on access");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores `value` under `key`, using `ttl` or the configured default.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        if !self.config.enabled || self.config.max_size == 0 {
            return;
        }

        let key = key.into();
        let ttl = ttl.unwrap_or(self.config.ttl);
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.config.max_size {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.creation_order())
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                debug!(key = %oldest, "Evicted oldest cache entry to make room");
            }
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, CacheEntry::new(value, ttl, sequence));
    }

    /// Returns true if `key` is present and unexpired.
    ///
    /// An expired entry is removed on access. Does not count as a hit.
    pub fn has(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Removes `key`. Returns true if an entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.entries.lock().remove(key).is_some()
    }

    /// Removes every entry and resets the hit counters.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Sweeps all expired entries. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        if !self.config.enabled {
            return CacheStats {
                max_size: self.config.max_size,
                ..Default::default()
            };
        }

        let now = Instant::now();
        let entries = self.entries.lock();
        let mut details: Vec<((Instant, u64), CacheEntryStats)> = entries
            .iter()
            .map(|(key, entry)| {
                (
                    entry.creation_order(),
                    CacheEntryStats {
                        key: key.clone(),
                        age: now.saturating_duration_since(entry.created_at),
                        ttl_remaining: entry.expires_at.saturating_duration_since(now),
                        hits: entry.hits,
                    },
                )
            })
            .collect();
        details.sort_by_key(|(order, _)| *order);

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            size: entries.len(),
            max_size: self.config.max_size,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            entries: details.into_iter().map(|(_, stats)| stats).collect(),
        }
    }
}

impl<V> std::fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("size", &self.entries.lock().len())
            .finish()
    }
}

/// Builds a cache key from method, path, sorted query parameters and body.
///
/// Query parameters are taken from a `BTreeMap`, so two requests differing only
/// in parameter order share a key.
pub fn cache_key(
    method: &str,
    path: &str,
    query: &BTreeMap<String, String>,
    body: Option<&serde_json::Value>,
) -> String {
    let query = query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let body = body.map(|b| b.to_string()).unwrap_or_default();
    format!("{}:{}?{}#{}", method.to_uppercase(), path, query, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_ms: u64, max_size: usize) -> Cache<String> {
        Cache::new(CacheConfig {
            enabled: true,
            ttl: Duration::from_millis(ttl_ms),
            max_size,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_returns_value() {
        let cache = cache(1000, 10);
        cache.set("k", "v".to_string(), None);
        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert!(cache.has("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = cache(1000, 10);
        cache.set("k", "v".to_string(), Some(Duration::from_millis(200)));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k"), Some("v".to_string()));

        tokio::time::advance(Duration::from_millis(51)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0, "expired entry is removed on access");
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_evicts_expired_entry() {
        let cache = cache(100, 10);
        cache.set("k", "v".to_string(), None);
        tokio::time::advance(Duration::from_millis(101)).await;

        assert_eq!(cache.len(), 1);
        assert!(!cache.has("k"));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_oldest_created_not_least_used() {
        let cache = cache(10_000, 3);
        cache.set("a", "1".to_string(), None);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("b", "2".to_string(), None);
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("c", "3".to_string(), None);

        for _ in 0..5 {
            cache.get("a");
        }

        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("d", "4".to_string(), None);

        assert!(!cache.has("a"));
        assert!(cache.has("b"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_instant_entries_evict_in_insertion_order() {
        let cache = cache(10_000, 3);
        for key in ["k0", "k1", "k2"] {
            cache.set(key, key.to_string(), None);
        }

        for (i, key) in ["k3", "k4", "k5"].into_iter().enumerate() {
            cache.set(key, key.to_string(), None);
            assert!(!cache.has(&format!("k{i}")), "k{i} should be evicted before {key}");
        }

        let order: Vec<String> = cache.stats().entries.into_iter().map(|e| e.key).collect();
        assert_eq!(order, vec!["k3", "k4", "k5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict() {
        let cache = cache(10_000, 2);
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        cache.set("a", "updated".to_string(), None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some("updated".to_string()));
        assert!(cache.has("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_sweeps_expired() {
        let cache = cache(100, 10);
        cache.set("short", "1".to_string(), None);
        cache.set("long", "2".to_string(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.has("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_reports_hit_rate_and_entries() {
        let cache = cache(1000, 10);
        cache.set("a", "1".to_string(), None);
        cache.get("a");
        cache.get("a");
        cache.get("missing");

        tokio::time::advance(Duration::from_millis(100)).await;
        let stats = cache.stats();

        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.entries[0].key, "a");
        assert_eq!(stats.entries[0].hits, 2);
        assert_eq!(stats.entries[0].age, Duration::from_millis(100));
        assert_eq!(stats.entries[0].ttl_remaining, Duration::from_millis(900));
    }

    #[test]
    fn test_disabled_cache_is_noop() {
        let cache: Cache<String> = Cache::new(CacheConfig::disabled());
        cache.set("k", "v".to_string(), None);

        assert_eq!(cache.get("k"), None);
        assert!(!cache.has("k"));
        assert!(!cache.delete("k"));
        assert_eq!(cache.cleanup(), 0);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache(1000, 10);
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_key_sorts_query() {
        let mut q1 = BTreeMap::new();
        q1.insert("b".to_string(), "2".to_string());
        q1.insert("a".to_string(), "1".to_string());

        let mut q2 = BTreeMap::new();
        q2.insert("a".to_string(), "1".to_string());
        q2.insert("b".to_string(), "2".to_string());

        assert_eq!(cache_key("get", "/x", &q1, None), cache_key("GET", "/x", &q2, None));
        assert_eq!(cache_key("GET", "/x", &q1, None), "GET:/x?a=1&b=2#");

        let body = serde_json::json!({"id": 1});
        assert_ne!(
            cache_key("GET", "/x", &q1, Some(&body)),
            cache_key("GET", "/x", &q1, None)
        );
    }
}
