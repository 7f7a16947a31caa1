//! Two-tier cache implementation: an LRU memory tier in front of a
//! persistent tier.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use toolgate_core::router::ResponseCache;

const MEMORY_CAPACITY: usize = 1_000;
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub hit_count: u64,
    pub last_hit_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// `invalidate`'s filter: any combination of `serverId`, `type`, `name`
/// narrows the persistent-tier `LIKE` delete; all absent matches everything.
#[derive(Debug, Clone, Default)]
pub struct CacheInvalidateFilter {
    pub server_id: Option<Uuid>,
    pub cache_type: Option<String>,
    pub name: Option<String>,
}

impl CacheInvalidateFilter {
    /// Builds the `LIKE` pattern over the `"<type>:<serverId>:<toolName>:<paramsHash>"`
    /// key shape, substituting `%` for whichever components were not given.
    pub fn like_pattern(&self) -> String {
        let cache_type = self.cache_type.as_deref().unwrap_or("%");
        let server_id = self.server_id.map(|id| id.to_string()).unwrap_or_else(|| "%".to_string());
        let name = self.name.as_deref().unwrap_or("%");
        format!("{cache_type}:{server_id}:{name}:%")
    }
}

/// Persistence seam for the second tier, implemented by `toolgate-persistence`.
#[async_trait]
pub trait PersistentCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<CacheEntry>;
    async fn set(&self, key: &str, entry: CacheEntry);
    async fn delete(&self, key: &str);
    /// Deletes every row whose key matches the `LIKE` pattern; returns the count removed.
    async fn delete_matching(&self, pattern: &str) -> usize;
    /// Bumps a persisted entry's hit counters without touching its value or expiry.
    async fn record_hit(&self, key: &str, hit_count: u64, last_hit_at: DateTime<Utc>);
    /// Removes every entry whose `expires_at` has passed; returns the count removed.
    async fn purge_expired(&self) -> usize;
}

/// Memory tier backed by an LRU of bounded size, persistent tier behind a
/// trait object so the gateway crate doesn't need to know about SQLite.
pub struct TwoTierCache {
    memory: Mutex<LruCache<String, CacheEntry>>,
    store: Arc<dyn PersistentCacheStore>,
    memory_hits: AtomicU64,
    db_hits: AtomicU64,
}

impl TwoTierCache {
    pub fn new(store: Arc<dyn PersistentCacheStore>) -> Self {
        Self {
            memory: Mutex::new(LruCache::new(NonZeroUsize::new(MEMORY_CAPACITY).unwrap())),
            store,
            memory_hits: AtomicU64::new(0),
            db_hits: AtomicU64::new(0),
        }
    }

    /// Counts of hits served from each tier since startup, for metrics.
    pub fn hit_counts(&self) -> (u64, u64) {
        (self.memory_hits.load(Ordering::Relaxed), self.db_hits.load(Ordering::Relaxed))
    }

    /// Single-key invalidation, kept for callers that already have the exact key.
    pub async fn invalidate(&self, key: &str) {
        self.memory.lock().await.pop(key);
        self.store.delete(key).await;
    }

    /// Filter-based invalidation: deletes matching rows from the persistent
    /// tier and, if anything was deleted, clears the entire memory tier
    /// rather than scanning it key-by-key for matches.
    pub async fn invalidate_matching(&self, filter: CacheInvalidateFilter) -> usize {
        let removed = self.store.delete_matching(&filter.like_pattern()).await;
        if removed > 0 {
            self.memory.lock().await.clear();
        }
        removed
    }

    /// Runs one purge pass immediately, for graceful shutdown where the
    /// background loop won't get another tick.
    pub async fn purge_now(&self) -> usize {
        self.store.purge_expired().await
    }

    /// Spawns the background purge loop; the returned handle should be kept
    /// alive by the owner.
    pub fn spawn_purge_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.spawn_purge_task_with_interval(std::time::Duration::from_secs(DEFAULT_PURGE_INTERVAL_SECS))
    }

    pub fn spawn_purge_task_with_interval(self: Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.store.purge_expired().await;
                if removed > 0 {
                    warn!(removed, "purged expired cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl ResponseCache for TwoTierCache {
    async fn get(&self, key: &str) -> Option<Value> {
        {
            let mut memory = self.memory.lock().await;
            if let Some(entry) = memory.get_mut(key) {
                if !entry.is_expired() {
                    entry.hit_count += 1;
                    entry.last_hit_at = Some(Utc::now());
                    self.memory_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                memory.pop(key);
            }
        }

        if let Some(mut entry) = self.store.get(key).await {
            if !entry.is_expired() {
                self.db_hits.fetch_add(1, Ordering::Relaxed);
                entry.hit_count += 1;
                entry.last_hit_at = Some(Utc::now());
                let value = entry.value.clone();
                self.memory.lock().await.put(key.to_string(), entry.clone());

                let store = self.store.clone();
                let key = key.to_string();
                let hit_count = entry.hit_count;
                let last_hit_at = entry.last_hit_at.unwrap();
                tokio::spawn(async move {
                    store.record_hit(&key, hit_count, last_hit_at).await;
                });

                return Some(value);
            }
            self.store.delete(key).await;
        }
        None
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: u64) {
        let entry = CacheEntry {
            value,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs as i64),
            ttl_seconds: ttl_secs,
            hit_count: 0,
            last_hit_at: None,
        };
        self.memory.lock().await.put(key.to_string(), entry.clone());
        self.store.set(key, entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeStore(StdMutex<HashMap<String, CacheEntry>>);

    #[async_trait]
    impl PersistentCacheStore for FakeStore {
        async fn get(&self, key: &str) -> Option<CacheEntry> {
            self.0.lock().unwrap().get(key).cloned()
        }
        async fn set(&self, key: &str, entry: CacheEntry) {
            self.0.lock().unwrap().insert(key.to_string(), entry);
        }
        async fn delete(&self, key: &str) {
            self.0.lock().unwrap().remove(key);
        }
        async fn delete_matching(&self, pattern: &str) -> usize {
            let prefix = pattern.trim_end_matches('%');
            let mut store = self.0.lock().unwrap();
            let before = store.len();
            store.retain(|k, _| !k.starts_with(prefix));
            before - store.len()
        }
        async fn record_hit(&self, key: &str, hit_count: u64, last_hit_at: DateTime<Utc>) {
            if let Some(entry) = self.0.lock().unwrap().get_mut(key) {
                entry.hit_count = hit_count;
                entry.last_hit_at = Some(last_hit_at);
            }
        }
        async fn purge_expired(&self) -> usize {
            let mut store = self.0.lock().unwrap();
            let before = store.len();
            store.retain(|_, v| !v.is_expired());
            before - store.len()
        }
    }

    fn cache() -> TwoTierCache {
        TwoTierCache::new(Arc::new(FakeStore(StdMutex::new(HashMap::new()))))
    }

    #[tokio::test]
    async fn set_then_get_returns_the_value() {
        let cache = cache();
        cache.set("k", Value::String("v".into()), 300).await;
        assert_eq!(cache.get("k").await, Some(Value::String("v".into())));
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let cache = cache();
        cache.set("k", Value::String("v".into()), 0).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn invalidate_removes_from_both_tiers() {
        let cache = cache();
        cache.set("k", Value::String("v".into()), 300).await;
        cache.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn memory_miss_falls_back_to_persistent_tier() {
        let store = Arc::new(FakeStore(StdMutex::new(HashMap::new())));
        let entry = CacheEntry {
            value: Value::String("from-disk".into()),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            ttl_seconds: 60,
            hit_count: 0,
            last_hit_at: None,
        };
        store.set("k", entry).await;
        let cache = TwoTierCache::new(store);
        assert_eq!(cache.get("k").await, Some(Value::String("from-disk".into())));
    }

    #[tokio::test]
    async fn hit_counts_track_which_tier_served_the_value() {
        let cache = cache();
        cache.set("k", Value::String("v".into()), 300).await;
        cache.get("k").await;
        cache.get("k").await;
        assert_eq!(cache.hit_counts(), (2, 0));
    }

    #[tokio::test]
    async fn invalidate_matching_clears_the_whole_memory_tier_when_something_was_deleted() {
        let cache = cache();
        cache.set("tool:server-a:read:none", Value::String("a".into()), 300).await;
        cache.set("tool:server-b:read:none", Value::String("b".into()), 300).await;

        let removed = cache
            .invalidate_matching(CacheInvalidateFilter {
                server_id: None,
                cache_type: Some("tool".to_string()),
                name: None,
            })
            .await;
        assert_eq!(removed, 2);
        assert_eq!(cache.get("tool:server-a:read:none").await, None);
        assert_eq!(cache.get("tool:server-b:read:none").await, None);
    }

    #[tokio::test]
    async fn invalidate_matching_leaves_memory_tier_untouched_when_nothing_matched() {
        let cache = cache();
        cache.set("tool:server-a:read:none", Value::String("a".into()), 300).await;

        let removed = cache
            .invalidate_matching(CacheInvalidateFilter {
                server_id: None,
                cache_type: Some("webhook".to_string()),
                name: None,
            })
            .await;
        assert_eq!(removed, 0);
        assert_eq!(cache.get("tool:server-a:read:none").await, Some(Value::String("a".into())));
    }
}
