//! TTL + LRU cache for expensive analytics reads, with hit/miss stats, glob
//! invalidation, a background sweep, and optional mirroring into key-value
//! storage so a restart starts warm.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use regex::Regex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ts_rs::TS;
use utils::{clock::Clock, storage::KvStorage};

/// Storage key prefix for mirrored entries.
const PERSIST_PREFIX: &str = "fb_analytics_";
/// Background sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(120);
const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Content classes with TTLs reflecting their volatility and fetch cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Survey definitions change rarely.
    Surveys,
    /// Aggregated analytics tolerate moderate staleness.
    Analytics,
    /// Individual responses arrive continuously.
    Responses,
}

impl CacheClass {
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::Surveys => Duration::from_secs(15 * 60),
            Self::Analytics => Duration::from_secs(10 * 60),
            Self::Responses => Duration::from_secs(3 * 60),
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Surveys => "surveys",
            Self::Analytics => "analytics",
            Self::Responses => "responses",
        }
    }
}

/// Composite cache key: `{class}:{identifier}:{filters-hash}`.
pub fn cache_key(class: CacheClass, identifier: &str, filters: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(filters.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}:{}:{}", class.prefix(), identifier, &digest[..12])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    payload: String,
    compressed: bool,
    stored_at_ms: u64,
    ttl_ms: u64,
    size_bytes: usize,
    hits: u64,
    last_access_ms: u64,
}

impl CacheEntry {
    fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.stored_at_ms) > self.ttl_ms
    }
}

#[derive(Debug, Default)]
struct CacheMap {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
}

impl CacheMap {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.total_bytes += entry.size_bytes;
        if let Some(old) = self.entries.insert(key, entry) {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct AnalyticsCache {
    map: Mutex<CacheMap>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    storage: Option<Arc<dyn KvStorage>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AnalyticsCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            map: Mutex::new(CacheMap::default()),
            config,
            clock,
            storage: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache mirrored into `storage` under `fb_analytics_*` keys. Entries
    /// already expired at load time are discarded.
    ///
    /// Only writes and removals touch the mirror; read-side hit counts and
    /// recency bumps stay in memory. After a rehydration the LRU order
    /// therefore reflects write order until entries are read again.
    pub fn with_storage(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn KvStorage>,
    ) -> Self {
        let now_ms = clock.now_ms();
        let mut map = CacheMap::default();
        let mut rehydrated = 0usize;
        for storage_key in storage.keys_with_prefix(PERSIST_PREFIX) {
            let Some(raw) = storage.get(&storage_key) else {
                continue;
            };
            match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) if !entry.expired(now_ms) => {
                    let key = storage_key[PERSIST_PREFIX.len()..].to_string();
                    map.insert(key, entry);
                    rehydrated += 1;
                }
                Ok(_) | Err(_) => storage.remove(&storage_key),
            }
        }
        if rehydrated > 0 {
            info!(entries = rehydrated, "rehydrated analytics cache from storage");
        }
        Self {
            map: Mutex::new(map),
            config,
            clock,
            storage: Some(storage),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Null on miss or expiry; expired entries are deleted lazily on read.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now_ms = self.clock.now_ms();
        let mut map = self.map.lock().await;
        let live = match map.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => !entry.expired(now_ms),
        };
        if !live {
            map.remove(key);
            self.remove_persisted(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let payload = {
            let Some(entry) = map.entries.get_mut(key) else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            entry.hits += 1;
            entry.last_access_ms = now_ms;
            if entry.compressed {
                decompress(&entry.payload)
            } else {
                entry.payload.clone()
            }
        };
        drop(map);
        match serde_json::from_str(&payload) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                // A corrupt payload is a miss, never an error for the caller.
                warn!(key, error = %e, "cached payload failed to parse, treating as miss");
                let mut map = self.map.lock().await;
                map.remove(key);
                self.remove_persisted(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value under `key`. `ttl` falls back to the analytics default.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                warn!(key, error = %e, "value failed to serialize, not cached");
                return;
            }
        };
        let (payload, compressed) = compress(payload);
        let now_ms = self.clock.now_ms();
        let entry = CacheEntry {
            size_bytes: payload.len() + key.len(),
            payload,
            compressed,
            stored_at_ms: now_ms,
            ttl_ms: ttl.unwrap_or(DEFAULT_TTL).as_millis() as u64,
            hits: 0,
            last_access_ms: now_ms,
        };
        if entry.size_bytes > self.config.max_bytes {
            warn!(
                key,
                size_bytes = entry.size_bytes,
                max_bytes = self.config.max_bytes,
                "entry larger than the whole byte budget, not cached"
            );
            return;
        }

        let mut map = self.map.lock().await;
        map.remove(key);
        self.evict_for(&mut map, entry.size_bytes);
        self.persist(key, &entry);
        map.insert(key.to_string(), entry);
    }

    /// Evict least-recently-used entries until the new entry fits both the
    /// count and byte budgets.
    fn evict_for(&self, map: &mut CacheMap, incoming_bytes: usize) {
        while map.entries.len() >= self.config.max_entries
            || (map.total_bytes + incoming_bytes > self.config.max_bytes
                && !map.entries.is_empty())
        {
            let Some(lru_key) = map
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access_ms)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            debug!(key = %lru_key, "evicting least recently used cache entry");
            map.remove(&lru_key);
            self.remove_persisted(&lru_key);
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut map = self.map.lock().await;
        let removed = map.remove(key).is_some();
        if removed {
            self.remove_persisted(key);
        }
        removed
    }

    /// Delete all keys matching a glob pattern (`*` wildcard). Returns the
    /// number removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let regex = match glob_to_regex(pattern) {
            Ok(r) => r,
            Err(e) => {
                warn!(pattern, error = %e, "invalid invalidation pattern");
                return 0;
            }
        };
        let mut map = self.map.lock().await;
        let keys: Vec<String> = map
            .entries
            .keys()
            .filter(|k| regex.is_match(k))
            .cloned()
            .collect();
        for key in &keys {
            map.remove(key);
            self.remove_persisted(key);
        }
        keys.len()
    }

    /// Proactive purge of expired entries; also run by the sweeper.
    pub async fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut map = self.map.lock().await;
        let expired: Vec<String> = map
            .entries
            .iter()
            .filter(|(_, e)| e.expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            map.remove(key);
            self.remove_persisted(key);
        }
        if !expired.is_empty() {
            debug!(purged = expired.len(), "cache sweep removed expired entries");
        }
        expired.len()
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                cache.purge_expired().await;
            }
        })
    }

    pub async fn stats(&self) -> CacheStats {
        let map = self.map.lock().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: map.entries.len(),
            total_bytes: map.total_bytes,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                (hits as f64 / lookups as f64 * 100.0 * 100.0).round() / 100.0
            },
        }
    }

    fn persist(&self, key: &str, entry: &CacheEntry) {
        let Some(storage) = &self.storage else { return };
        match serde_json::to_string(entry) {
            Ok(raw) => {
                if let Err(e) = storage.set(&format!("{PERSIST_PREFIX}{key}"), &raw) {
                    warn!(key, error = %e, "failed to mirror cache entry to storage");
                }
            }
            Err(e) => warn!(key, error = %e, "failed to serialize cache entry for storage"),
        }
    }

    fn remove_persisted(&self, key: &str) {
        if let Some(storage) = &self.storage {
            storage.remove(&format!("{PERSIST_PREFIX}{key}"));
        }
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$"))
}

/// Dictionary substitutions for the JSON key names that dominate survey
/// payloads. Naive by intent; skipped entirely when the input contains the
/// marker character.
const COMPRESSION_DICT: &[(&str, &str)] = &[
    ("\"createdAt\":", "\u{1}c"),
    ("\"updatedAt\":", "\u{1}u"),
    ("\"surveyId\":", "\u{1}s"),
    ("\"finished\":", "\u{1}f"),
    ("\"questions\":", "\u{1}q"),
    ("\"headline\":", "\u{1}h"),
];

fn compress(payload: String) -> (String, bool) {
    if payload.contains('\u{1}') {
        return (payload, false);
    }
    let mut out = payload.clone();
    for (from, to) in COMPRESSION_DICT {
        out = out.replace(from, to);
    }
    if out.len() < payload.len() {
        (out, true)
    } else {
        (payload, false)
    }
}

fn decompress(payload: &str) -> String {
    let mut out = payload.to_string();
    for (from, to) in COMPRESSION_DICT {
        out = out.replace(to, from);
    }
    out
}

#[cfg(test)]
mod tests {
    use utils::clock::MockClock;
    use utils::storage::MemoryStorage;

    use super::*;

    fn cache_with_clock() -> (Arc<AnalyticsCache>, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new(1_000_000));
        let cache = Arc::new(AnalyticsCache::new(
            CacheConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        (cache, clock)
    }

    #[tokio::test]
    async fn get_before_ttl_returns_value_after_ttl_returns_none() {
        let (cache, clock) = cache_with_clock();
        cache
            .set("analytics:env:abc", &vec![1, 2, 3], Some(Duration::from_millis(100)))
            .await;

        clock.advance(50);
        let hit: Option<Vec<i32>> = cache.get("analytics:env:abc").await;
        assert_eq!(hit, Some(vec![1, 2, 3]));

        clock.advance(100);
        let miss: Option<Vec<i32>> = cache.get("analytics:env:abc").await;
        assert_eq!(miss, None);
    }

    #[tokio::test]
    async fn lru_eviction_respects_entry_budget() {
        let clock = Arc::new(MockClock::new(0));
        let cache = AnalyticsCache::new(
            CacheConfig {
                max_entries: 2,
                max_bytes: usize::MAX,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        cache.set("a", &1, None).await;
        clock.advance(10);
        cache.set("b", &2, None).await;
        clock.advance(10);
        // Touch "a" so "b" becomes least recently used.
        let _: Option<i32> = cache.get("a").await;
        clock.advance(10);
        cache.set("c", &3, None).await;

        assert_eq!(cache.get::<i32>("a").await, Some(1));
        assert_eq!(cache.get::<i32>("b").await, None);
        assert_eq!(cache.get::<i32>("c").await, Some(3));
    }

    #[tokio::test]
    async fn oversized_entry_is_rejected_without_evicting_others() {
        let clock = Arc::new(MockClock::new(0));
        let cache = AnalyticsCache::new(
            CacheConfig {
                max_entries: 10,
                max_bytes: 64,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        cache.set("a", &1, None).await;
        cache.set("big", &"x".repeat(200), None).await;

        assert_eq!(cache.get::<String>("big").await, None);
        assert_eq!(cache.get::<i32>("a").await, Some(1));
    }

    #[tokio::test]
    async fn invalidate_by_glob_returns_count() {
        let (cache, _) = cache_with_clock();
        cache.set("surveys:env:aaa", &1, None).await;
        cache.set("surveys:env:bbb", &2, None).await;
        cache.set("responses:env:ccc", &3, None).await;

        assert_eq!(cache.invalidate("surveys:*").await, 2);
        assert_eq!(cache.get::<i32>("responses:env:ccc").await, Some(3));
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn purge_expired_removes_only_stale_entries() {
        let (cache, clock) = cache_with_clock();
        cache.set("short", &1, Some(Duration::from_millis(50))).await;
        cache.set("long", &2, Some(Duration::from_secs(60))).await;

        clock.advance(100);
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.get::<i32>("long").await, Some(2));
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let (cache, _) = cache_with_clock();
        cache.set("k", &1, None).await;
        let _: Option<i32> = cache.get("k").await;
        let _: Option<i32> = cache.get("absent").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 50.0);
    }

    #[tokio::test]
    async fn persistence_rehydrates_and_discards_expired() {
        let clock = Arc::new(MockClock::new(0));
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());

        {
            let cache = AnalyticsCache::with_storage(
                CacheConfig::default(),
                Arc::clone(&clock) as Arc<dyn Clock>,
                Arc::clone(&storage),
            );
            cache.set("keep", &"warm", Some(Duration::from_secs(600))).await;
            cache.set("drop", &"stale", Some(Duration::from_millis(10))).await;
        }

        clock.advance(1_000);
        let cache = AnalyticsCache::with_storage(
            CacheConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Arc::clone(&storage),
        );
        assert_eq!(cache.get::<String>("keep").await, Some("warm".to_string()));
        assert_eq!(cache.get::<String>("drop").await, None);
    }

    #[tokio::test]
    async fn compression_roundtrips_survey_shaped_json() {
        let (cache, _) = cache_with_clock();
        let value = serde_json::json!({
            "surveyId": "s1",
            "createdAt": "2026-01-01T00:00:00Z",
            "finished": true,
            "questions": [{"headline": "How satisfied are you?"}]
        });
        cache.set("responses:env:x", &value, None).await;
        let back: Option<serde_json::Value> = cache.get("responses:env:x").await;
        assert_eq!(back, Some(value));
    }

    #[test]
    fn cache_keys_differ_by_filters() {
        let a = cache_key(CacheClass::Analytics, "env1", &serde_json::json!({"range": 7}));
        let b = cache_key(CacheClass::Analytics, "env1", &serde_json::json!({"range": 30}));
        assert_ne!(a, b);
        assert!(a.starts_with("analytics:env1:"));
    }
}
