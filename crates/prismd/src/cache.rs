//! Response cache with per-entry TTL, bounded size and best-effort
//! persistence.
//!
//! Eviction is strict FIFO by insertion time: when full, the entry inserted
//! longest ago goes, regardless of how recently it was read. Expired entries
//! are dropped lazily on `get` and actively by `sweep`.
//!
//! Store writes happen after the entry lock is released, serialized by a
//! separate gate so a later snapshot never lands before an earlier one.
//! Lazy removals only mark the cache dirty; the next write or sweep
//! persists them.

use prism_shared::{Clock, PrismError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    /// Epoch milliseconds
    pub inserted_at: u64,
    /// Per-entry TTL override in milliseconds
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Insertion order, breaks ties between equal timestamps
    #[serde(default)]
    pub seq: u64,
}

impl CacheEntry {
    fn is_live(&self, now_ms: u64, default_ttl_ms: u64) -> bool {
        let ttl = self.ttl_ms.unwrap_or(default_ttl_ms);
        now_ms.saturating_sub(self.inserted_at) <= ttl
    }
}

/// Persisted cache layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedCache {
    pub entries: HashMap<String, CacheEntry>,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

// ============================================================================
// Storage backends
// ============================================================================

/// Durable backing store for the cache
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet
    fn load(&self) -> Result<Option<PersistedCache>, PrismError>;

    fn save(&self, cache: &PersistedCache) -> Result<(), PrismError>;
}

/// JSON file store with an optional size quota
pub struct FileStore {
    path: PathBuf,
    quota_bytes: Option<usize>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            quota_bytes: None,
        }
    }

    /// Refuse to write files larger than `bytes`
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl CacheStore for FileStore {
    fn load(&self) -> Result<Option<PersistedCache>, PrismError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let cache = serde_json::from_str(&content)?;
        Ok(Some(cache))
    }

    fn save(&self, cache: &PersistedCache) -> Result<(), PrismError> {
        let json = serde_json::to_string(cache)?;
        if let Some(quota) = self.quota_bytes {
            if json.len() > quota {
                return Err(PrismError::Persistence(format!(
                    "quota exceeded ({} > {} bytes)",
                    json.len(),
                    quota
                )));
            }
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store; can be told to fail upcoming saves
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<PersistedCache>>,
    fail_next: AtomicUsize,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedCache) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Default::default()
        }
    }

    /// Fail the next `n` save attempts
    pub fn fail_next_saves(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Successful saves so far
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Option<PersistedCache> {
        lock(&self.state).clone()
    }
}

impl CacheStore for MemoryStore {
    fn load(&self) -> Result<Option<PersistedCache>, PrismError> {
        Ok(lock(&self.state).clone())
    }

    fn save(&self, cache: &PersistedCache) -> Result<(), PrismError> {
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(PrismError::Persistence("quota exceeded".to_string()));
        }
        *lock(&self.state) = Some(cache.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    fn load(&self) -> Result<Option<PersistedCache>, PrismError> {
        (**self).load()
    }

    fn save(&self, cache: &PersistedCache) -> Result<(), PrismError> {
        (**self).save(cache)
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    next_seq: u64,
    /// Memory differs from the last successful save
    dirty: bool,
}

impl CacheInner {
    fn oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.inserted_at, e.seq))
            .map(|(k, _)| k.clone())
    }

    /// Drop the `n` oldest entries
    fn evict_oldest(&mut self, n: usize) -> usize {
        let mut evicted = 0;
        while evicted < n {
            match self.oldest_key() {
                Some(key) => {
                    self.entries.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    fn snapshot(&self) -> PersistedCache {
        PersistedCache {
            entries: self.entries.clone(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

/// Bounded TTL cache for reasoning responses
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    clock: Arc<dyn Clock>,
    store: Option<Box<dyn CacheStore>>,
    persist_gate: Mutex<()>,
    max_entries: usize,
    default_ttl_ms: u64,
}

impl ResponseCache {
    /// * `max_entries` - capacity, at least 1
    /// * `default_ttl` - TTL for entries set without an override
    pub fn new(max_entries: usize, default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            clock,
            store: None,
            persist_gate: Mutex::new(()),
            max_entries: max_entries.max(1),
            default_ttl_ms: default_ttl.as_millis() as u64,
        }
    }

    /// Attach a backing store and restore whatever it holds.
    /// A store that cannot be read is treated as empty.
    pub fn with_store(mut self, store: Box<dyn CacheStore>) -> Self {
        match store.load() {
            Ok(Some(persisted)) => {
                let now = self.clock.now_ms();
                let mut inner = CacheInner {
                    hits: persisted.hits,
                    misses: persisted.misses,
                    ..Default::default()
                };
                let mut restored: Vec<(String, CacheEntry)> = persisted
                    .entries
                    .into_iter()
                    .filter(|(_, e)| e.is_live(now, self.default_ttl_ms))
                    .collect();
                restored.sort_by_key(|(_, e)| (e.inserted_at, e.seq));
                for (key, mut entry) in restored {
                    entry.seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.entries.insert(key, entry);
                }
                let overflow = inner.entries.len().saturating_sub(self.max_entries);
                inner.evict_oldest(overflow);
                info!("Restored {} cached responses", inner.entries.len());
                self.inner = Mutex::new(inner);
            }
            Ok(None) => debug!("No persisted cache found"),
            Err(e) => warn!("Persisted cache unreadable, starting empty: {}", e),
        }
        self.store = Some(store);
        self
    }

    /// Look up a live value. Expired entries count as a miss and are removed.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = self.clock.now_ms();
        let mut inner = lock(&self.inner);

        let live = match inner.entries.get(key) {
            Some(entry) if entry.is_live(now, self.default_ttl_ms) => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                inner.dirty = true;
                debug!("Cache entry expired: {}", key);
                None
            }
            None => None,
        };

        match live {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Look up a live value without touching the hit/miss counters
    pub fn peek(&self, key: &str) -> Option<serde_json::Value> {
        let now = self.clock.now_ms();
        lock(&self.inner)
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now, self.default_ttl_ms))
            .map(|entry| entry.value.clone())
    }

    /// Insert or replace a value, evicting the oldest entry when full
    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        self.update(|inner| {
            self.insert(inner, key, value, ttl);
            true
        });
    }

    fn insert(
        &self,
        inner: &mut CacheInner,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) {
        let now = self.clock.now_ms();

        if !inner.entries.contains_key(key) && inner.entries.len() >= self.max_entries {
            if let Some(oldest) = inner.oldest_key() {
                inner.entries.remove(&oldest);
                debug!("Cache full, evicted {}", oldest);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                ttl_ms: ttl.map(|t| t.as_millis() as u64),
                seq,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut removed = false;
        self.update(|inner| {
            removed = inner.entries.remove(key).is_some();
            removed
        });
        removed
    }

    /// Drop every entry and reset hit/miss counters
    pub fn clear(&self) {
        self.update(|inner| {
            inner.entries.clear();
            inner.hits = 0;
            inner.misses = 0;
            true
        });
    }

    /// Remove expired entries, returning how many were dropped.
    /// Also persists removals made lazily by `get`.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let ttl = self.default_ttl_ms;
        let mut removed = 0;
        self.update(|inner| {
            let before = inner.entries.len();
            inner.entries.retain(|_, e| e.is_live(now, ttl));
            removed = before - inner.entries.len();
            if removed > 0 {
                debug!("Cache sweep removed {} expired entries", removed);
            }
            removed > 0 || inner.dirty
        });
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let inner = lock(&self.inner);
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Run `sweep` on the blocking pool every `interval` until the cache
    /// is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                if let Err(e) = tokio::task::spawn_blocking(move || cache.sweep()).await {
                    warn!("Cache sweep task failed: {}", e);
                }
            }
        })
    }

    /// Apply `change` under the entry lock, then persist if it reports a
    /// modification
    fn update(&self, change: impl FnOnce(&mut CacheInner) -> bool) {
        let changed = {
            let mut inner = lock(&self.inner);
            let changed = change(&mut inner);
            inner.dirty |= changed;
            changed
        };
        if changed {
            self.persist();
        }
    }

    /// Write a snapshot to the store. On failure evict the oldest quarter
    /// of entries and retry once; a second failure is logged and dropped.
    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _gate = lock(&self.persist_gate);

        let snapshot = self.take_snapshot();
        let Err(e) = store.save(&snapshot) else {
            return;
        };

        let evicted = {
            let mut inner = lock(&self.inner);
            let n = (inner.entries.len() / 4).max(1);
            inner.evict_oldest(n)
        };
        warn!(
            "Cache persistence failed ({}), evicted {} oldest entries and retrying",
            e, evicted
        );
        let snapshot = self.take_snapshot();
        if let Err(e) = store.save(&snapshot) {
            lock(&self.inner).dirty = true;
            warn!("Cache persistence retry failed, continuing in memory: {}", e);
        }
    }

    fn take_snapshot(&self) -> PersistedCache {
        let mut inner = lock(&self.inner);
        inner.dirty = false;
        inner.snapshot()
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_shared::ManualClock;
    use serde_json::json;

    fn cache_with_clock(max: usize) -> (ResponseCache, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let cache = ResponseCache::new(max, Duration::from_secs(60), Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn test_ttl_boundary() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("k", json!("v"), Some(Duration::from_millis(100)));

        clock.advance(100);
        assert_eq!(cache.get("k"), Some(json!("v")));

        clock.advance(1);
        assert_eq!(cache.get("k"), None);
        // Lazy expiry removed the entry
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_default_ttl_applies_without_override() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("k", json!(1), None);
        clock.advance(60_000);
        assert!(cache.get("k").is_some());
        clock.advance(1);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_fifo_eviction_ignores_reads() {
        let (cache, clock) = cache_with_clock(2);
        cache.set("a", json!(1), None);
        clock.advance(1);
        cache.set("b", json!(2), None);
        // Reading "a" must not protect it: eviction is by age, not access
        assert!(cache.get("a").is_some());
        clock.advance(1);
        cache.set("c", json!(3), None);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_eviction_ties_broken_by_insertion_order() {
        let (cache, _clock) = cache_with_clock(2);
        cache.set("first", json!(1), None);
        cache.set("second", json!(2), None);
        cache.set("third", json!(3), None);
        assert!(cache.get("first").is_none());
        assert!(cache.get("second").is_some());
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let (cache, clock) = cache_with_clock(5);
        for i in 0..50 {
            cache.set(&format!("k{}", i % 13), json!(i), None);
            clock.advance(3);
            assert!(cache.len() <= 5);
        }
    }

    #[test]
    fn test_clear_resets_counters() {
        let (cache, _clock) = cache_with_clock(5);
        cache.set("k", json!(1), None);
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("short", json!(1), Some(Duration::from_millis(10)));
        cache.set("long", json!(2), None);
        clock.advance(11);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        // Sweeping does not touch counters
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_delete() {
        let (cache, _clock) = cache_with_clock(10);
        cache.set("k", json!(1), None);
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_persistence_failure_evicts_and_retries() {
        let (cache, clock) = cache_with_clock(10);
        let store = Arc::new(MemoryStore::new());
        let cache = cache.with_store(Box::new(store.clone()));
        for i in 0..8 {
            cache.set(&format!("k{}", i), json!(i), None);
            clock.advance(1);
        }
        assert_eq!(store.saves(), 8);

        store.fail_next_saves(1);
        cache.set("k8", json!(8), None);

        // 9 entries, quarter evicted (2), retry succeeded
        assert_eq!(cache.len(), 7);
        assert!(cache.get("k0").is_none());
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k8").is_some());
        assert_eq!(store.stored().unwrap().entries.len(), 7);
    }

    #[test]
    fn test_peek_leaves_counters_alone() {
        let (cache, clock) = cache_with_clock(10);
        cache.set("k", json!(1), Some(Duration::from_millis(10)));
        assert_eq!(cache.peek("k"), Some(json!(1)));
        assert_eq!(cache.peek("missing"), None);
        clock.advance(11);
        assert_eq!(cache.peek("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        // Peeking never removes
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lazy_expiry_persisted_by_sweep() {
        let (cache, clock) = cache_with_clock(10);
        let store = Arc::new(MemoryStore::new());
        let cache = cache.with_store(Box::new(store.clone()));
        cache.set("k", json!(1), Some(Duration::from_millis(10)));
        assert_eq!(store.stored().unwrap().entries.len(), 1);

        clock.advance(11);
        assert_eq!(cache.get("k"), None);
        assert_eq!(store.saves(), 1);

        // Nothing left to expire, but the lazy removal is still written
        assert_eq!(cache.sweep(), 0);
        assert_eq!(store.saves(), 2);
        assert!(store.stored().unwrap().entries.is_empty());

        // Clean cache: no further writes
        cache.sweep();
        assert_eq!(store.saves(), 2);
    }

    #[test]
    fn test_persistence_double_failure_keeps_memory() {
        let (cache, _clock) = cache_with_clock(10);
        let store = Arc::new(MemoryStore::new());
        let cache = cache.with_store(Box::new(store.clone()));
        store.fail_next_saves(2);
        cache.set("k", json!(1), None);
        // The single oldest entry was the new one; cache keeps working
        cache.set("j", json!(2), None);
        assert_eq!(cache.get("j"), Some(json!(2)));
        assert_eq!(store.saves(), 1);
    }

    #[test]
    fn test_restore_from_store_drops_expired() {
        let clock = ManualClock::new(10_000);
        let mut persisted = PersistedCache {
            hits: 4,
            misses: 2,
            ..Default::default()
        };
        persisted.entries.insert(
            "fresh".to_string(),
            CacheEntry {
                value: json!("a"),
                inserted_at: 9_900,
                ttl_ms: None,
                seq: 0,
            },
        );
        persisted.entries.insert(
            "stale".to_string(),
            CacheEntry {
                value: json!("b"),
                inserted_at: 1_000,
                ttl_ms: Some(100),
                seq: 1,
            },
        );

        let cache = ResponseCache::new(10, Duration::from_secs(60), Arc::new(clock))
            .with_store(Box::new(MemoryStore::with_state(persisted)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().hits, 4);
        assert_eq!(cache.get("fresh"), Some(json!("a")));
    }

    #[test]
    fn test_file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let clock = ManualClock::new(5_000);

        {
            let cache = ResponseCache::new(10, Duration::from_secs(60), Arc::new(clock.clone()))
                .with_store(Box::new(FileStore::new(&path)));
            cache.set("k", json!({"mood": "calm"}), None);
        }

        let cache = ResponseCache::new(10, Duration::from_secs(60), Arc::new(clock))
            .with_store(Box::new(FileStore::new(&path)));
        assert_eq!(cache.get("k"), Some(json!({"mood": "calm"})));
    }

    #[test]
    fn test_corrupt_file_means_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();
        let cache = ResponseCache::new(10, Duration::from_secs(60), Arc::new(ManualClock::new(0)))
            .with_store(Box::new(FileStore::new(&path)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_file_store_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("cache.json")).with_quota(16);
        let mut big = PersistedCache::default();
        big.entries.insert(
            "k".to_string(),
            CacheEntry {
                value: json!("a long enough value to exceed the quota"),
                inserted_at: 0,
                ttl_ms: None,
                seq: 0,
            },
        );
        assert!(matches!(store.save(&big), Err(PrismError::Persistence(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let clock = ManualClock::new(0);
        let cache = Arc::new(ResponseCache::new(
            10,
            Duration::from_millis(50),
            Arc::new(clock.clone()),
        ));
        cache.set("k", json!(1), None);
        let handle = cache.spawn_sweeper(Duration::from_secs(300));

        clock.advance(100);
        tokio::time::sleep(Duration::from_secs(301)).await;
        // The sweep itself runs on the blocking pool
        for _ in 0..50 {
            if cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 0);
        handle.abort();
    }
}
