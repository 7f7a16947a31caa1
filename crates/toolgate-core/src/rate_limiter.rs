//! Rate Limiter (C6): fixed-window per-minute and per-day counters keyed by
//! `(apiKeyId, serverId)`, plus a global `(apiKeyId, None)` bucket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::registry::RateLimitConfig;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct LimitKey {
    pub api_key_id: String,
    pub server_id: Option<Uuid>,
}

impl LimitKey {
    pub fn new(api_key_id: &str, server_id: Option<Uuid>) -> Self {
        Self {
            api_key_id: api_key_id.to_string(),
            server_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Window {
    minute_count: u32,
    minute_started_at: Option<DateTime<Utc>>,
    day_count: u32,
    day_started_at: Option<DateTime<Utc>>,
    dirty: bool,
}

impl Window {
    fn roll(&mut self, now: DateTime<Utc>) {
        let needs_new_minute = self
            .minute_started_at
            .map(|start| now.signed_duration_since(start).num_seconds() >= 60)
            .unwrap_or(true);
        if needs_new_minute {
            self.minute_count = 0;
            self.minute_started_at = Some(now);
        }
        let needs_new_day = self
            .day_started_at
            .map(|start| now.signed_duration_since(start).num_seconds() >= 86_400)
            .unwrap_or(true);
        if needs_new_day {
            self.day_count = 0;
            self.day_started_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitState {
    pub api_key_id: String,
    pub server_id: Option<Uuid>,
    pub minute_count: u32,
    pub minute_started_at: DateTime<Utc>,
    pub day_count: u32,
    pub day_started_at: DateTime<Utc>,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn flush(&self, states: Vec<LimitState>) -> Result<()>;
    async fn load_all(&self) -> Result<Vec<LimitState>>;
}

/// Tracks usage in memory and flushes dirty entries to the store every
/// [`FLUSH_INTERVAL`], so a crash loses at most one flush interval of counts.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    windows: RwLock<HashMap<LimitKey, Window>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(store: Arc<dyn RateLimitStore>) -> Result<Self> {
        let loaded = store.load_all().await?;
        let mut windows = HashMap::new();
        for state in loaded {
            let key = LimitKey::new(&state.api_key_id, state.server_id);
            windows.insert(
                key,
                Window {
                    minute_count: state.minute_count,
                    minute_started_at: Some(state.minute_started_at),
                    day_count: state.day_count,
                    day_started_at: Some(state.day_started_at),
                    dirty: false,
                },
            );
        }
        Ok(Self {
            store,
            windows: RwLock::new(windows),
        })
    }

    /// Checks and increments in one step; returns remaining counts on
    /// success, or `RateLimited` with a retry hint when exhausted.
    pub async fn check_and_increment(&self, key: &LimitKey, limits: &RateLimitConfig) -> Result<(u32, u32)> {
        let now = Utc::now();
        let mut windows = self.windows.write().await;
        let window = windows.entry(key.clone()).or_default();
        window.roll(now);

        let minute_exceeded = limits.per_minute > 0 && window.minute_count >= limits.per_minute;
        let day_exceeded = limits.per_day > 0 && window.day_count >= limits.per_day;
        if minute_exceeded || day_exceeded {
            let retry_after_ms = if minute_exceeded {
                let elapsed = now
                    .signed_duration_since(window.minute_started_at.unwrap_or(now))
                    .num_milliseconds()
                    .max(0) as u64;
                60_000u64.saturating_sub(elapsed)
            } else {
                let elapsed = now
                    .signed_duration_since(window.day_started_at.unwrap_or(now))
                    .num_milliseconds()
                    .max(0) as u64;
                86_400_000u64.saturating_sub(elapsed)
            };
            return Err(GatewayError::RateLimited {
                retry_after_ms,
                minute_remaining: limits.per_minute.saturating_sub(window.minute_count),
                day_remaining: limits.per_day.saturating_sub(window.day_count),
            });
        }

        window.minute_count += 1;
        window.day_count += 1;
        window.dirty = true;
        Ok((
            limits.per_minute.saturating_sub(window.minute_count),
            limits.per_day.saturating_sub(window.day_count),
        ))
    }

    pub async fn reset(&self, key: &LimitKey) {
        self.windows.write().await.remove(key);
    }

    /// Flushes every dirty window to the store and clears the dirty flag.
    /// Call on a periodic timer; also safe to call from tests directly.
    pub async fn flush(&self) -> Result<()> {
        let mut windows = self.windows.write().await;
        let dirty: Vec<(LimitKey, LimitState)> = windows
            .iter()
            .filter(|(_, w)| w.dirty)
            .map(|(key, w)| {
                (
                    key.clone(),
                    LimitState {
                        api_key_id: key.api_key_id.clone(),
                        server_id: key.server_id,
                        minute_count: w.minute_count,
                        minute_started_at: w.minute_started_at.unwrap_or_else(Utc::now),
                        day_count: w.day_count,
                        day_started_at: w.day_started_at.unwrap_or_else(Utc::now),
                    },
                )
            })
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        let states = dirty.iter().map(|(_, s)| s.clone()).collect();
        self.store.flush(states).await?;
        for (key, _) in dirty {
            if let Some(window) = windows.get_mut(&key) {
                window.dirty = false;
            }
        }
        Ok(())
    }

    /// Spawns the periodic flush task. The returned handle should be kept
    /// alive (or aborted) by the owner of the `Arc<RateLimiter>`.
    pub fn spawn_flush_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(err) = self.flush().await {
                    tracing::warn!(error = %err, "rate limiter flush failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeStore(StdMutex<Vec<LimitState>>);

    #[async_trait]
    impl RateLimitStore for FakeStore {
        async fn flush(&self, states: Vec<LimitState>) -> Result<()> {
            self.0.lock().unwrap().extend(states);
            Ok(())
        }
        async fn load_all(&self) -> Result<Vec<LimitState>> {
            Ok(Vec::new())
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(FakeStore(StdMutex::new(Vec::new()))))
    }

    #[tokio::test]
    async fn allows_calls_under_the_minute_limit() {
        let limiter = limiter();
        let key = LimitKey::new("key-1", None);
        let limits = RateLimitConfig { per_minute: 2, per_day: 100 };
        limiter.check_and_increment(&key, &limits).await.unwrap();
        limiter.check_and_increment(&key, &limits).await.unwrap();
        let err = limiter.check_and_increment(&key, &limits).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn zero_limit_means_unbounded() {
        let limiter = limiter();
        let key = LimitKey::new("key-1", None);
        let limits = RateLimitConfig { per_minute: 0, per_day: 0 };
        for _ in 0..1000 {
            limiter.check_and_increment(&key, &limits).await.unwrap();
        }
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let limiter = limiter();
        let key = LimitKey::new("key-1", None);
        let limits = RateLimitConfig { per_minute: 1, per_day: 100 };
        limiter.check_and_increment(&key, &limits).await.unwrap();
        limiter.check_and_increment(&key, &limits).await.unwrap_err();
        limiter.reset(&key).await;
        limiter.check_and_increment(&key, &limits).await.unwrap();
    }

    #[tokio::test]
    async fn flush_sends_only_dirty_entries() {
        let store = Arc::new(FakeStore(StdMutex::new(Vec::new())));
        let limiter = RateLimiter::new(store.clone());
        let key = LimitKey::new("key-1", None);
        let limits = RateLimitConfig { per_minute: 10, per_day: 100 };
        limiter.check_and_increment(&key, &limits).await.unwrap();
        limiter.flush().await.unwrap();
        assert_eq!(store.0.lock().unwrap().len(), 1);
        limiter.flush().await.unwrap();
        assert_eq!(store.0.lock().unwrap().len(), 1);
    }
}
