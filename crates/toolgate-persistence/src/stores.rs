//! Typed stores implementing the persistence seams defined by
//! `toolgate-core` and `toolgate-cache`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use toolgate_cache::{CacheEntry, PersistentCacheStore};
use toolgate_core::circuit_breaker::{BreakerSnapshot, BreakerState, BreakerStore};
use toolgate_core::rate_limiter::{LimitState, RateLimitStore};
use toolgate_core::registry::{ServerConfig, ServerStore};
use toolgate_core::{GatewayError, Result};
use toolgate_webhooks::delivery::{DeliveryStatus, WebhookDelivery, WebhookStore};
use toolgate_webhooks::subscription::WebhookSubscription;

pub struct SqliteServerStore {
    pool: SqlitePool,
}

impl SqliteServerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServerStore for SqliteServerStore {
    async fn load_all(&self) -> Result<Vec<ServerConfig>> {
        let rows = sqlx::query("SELECT config_json FROM servers")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::Internal(format!("load servers failed: {e}")))?;
        rows.into_iter()
            .map(|row| {
                let json: String = row.get("config_json");
                serde_json::from_str(&json).map_err(GatewayError::from)
            })
            .collect()
    }

    async fn upsert(&self, config: &ServerConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        sqlx::query(
            "INSERT INTO servers (id, name, config_json, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                config_json = excluded.config_json,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
        )
        .bind(config.id.to_string())
        .bind(&config.name)
        .bind(&json)
        .bind(config.enabled)
        .bind(config.created_at.to_rfc3339())
        .bind(config.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("upsert server failed: {e}")))?;
        Ok(())
    }
}

pub struct SqliteCacheStore {
    pool: SqlitePool,
}

impl SqliteCacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistentCacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let row = sqlx::query(
            "SELECT value_json, expires_at, ttl_seconds, hit_count, last_hit_at FROM response_cache WHERE cache_key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        let value_json: String = row.get("value_json");
        let expires_at: String = row.get("expires_at");
        let last_hit_at: Option<String> = row.get("last_hit_at");
        Some(CacheEntry {
            value: serde_json::from_str(&value_json).ok()?,
            expires_at: DateTime::parse_from_rfc3339(&expires_at).ok()?.with_timezone(&Utc),
            ttl_seconds: row.get::<i64, _>("ttl_seconds") as u64,
            hit_count: row.get::<i64, _>("hit_count") as u64,
            last_hit_at: last_hit_at.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc)),
        })
    }

    async fn set(&self, key: &str, entry: CacheEntry) {
        let Ok(value_json) = serde_json::to_string(&entry.value) else { return };
        let _ = sqlx::query(
            "INSERT INTO response_cache (cache_key, value_json, expires_at, ttl_seconds, hit_count, last_hit_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(cache_key) DO UPDATE SET
                value_json = excluded.value_json,
                expires_at = excluded.expires_at,
                ttl_seconds = excluded.ttl_seconds,
                hit_count = excluded.hit_count,
                last_hit_at = excluded.last_hit_at",
        )
        .bind(key)
        .bind(value_json)
        .bind(entry.expires_at.to_rfc3339())
        .bind(entry.ttl_seconds as i64)
        .bind(entry.hit_count as i64)
        .bind(entry.last_hit_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await;
    }

    async fn delete(&self, key: &str) {
        let _ = sqlx::query("DELETE FROM response_cache WHERE cache_key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await;
    }

    async fn delete_matching(&self, pattern: &str) -> usize {
        sqlx::query("DELETE FROM response_cache WHERE cache_key LIKE ?1")
            .bind(pattern)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected() as usize)
            .unwrap_or(0)
    }

    async fn record_hit(&self, key: &str, hit_count: u64, last_hit_at: DateTime<Utc>) {
        let _ = sqlx::query("UPDATE response_cache SET hit_count = ?1, last_hit_at = ?2 WHERE cache_key = ?3")
            .bind(hit_count as i64)
            .bind(last_hit_at.to_rfc3339())
            .bind(key)
            .execute(&self.pool)
            .await;
    }

    async fn purge_expired(&self) -> usize {
        let now = Utc::now().to_rfc3339();
        sqlx::query("DELETE FROM response_cache WHERE expires_at < ?1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected() as usize)
            .unwrap_or(0)
    }
}

pub struct SqliteRateLimitStore {
    pool: SqlitePool,
}

impl SqliteRateLimitStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for SqliteRateLimitStore {
    async fn flush(&self, states: Vec<LimitState>) -> Result<()> {
        for state in states {
            sqlx::query(
                "INSERT INTO rate_limit_state
                    (api_key_id, server_id, minute_count, minute_started_at, day_count, day_started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(api_key_id, server_id) DO UPDATE SET
                    minute_count = excluded.minute_count,
                    minute_started_at = excluded.minute_started_at,
                    day_count = excluded.day_count,
                    day_started_at = excluded.day_started_at",
            )
            .bind(&state.api_key_id)
            .bind(state.server_id.map(|id| id.to_string()))
            .bind(state.minute_count)
            .bind(state.minute_started_at.to_rfc3339())
            .bind(state.day_count)
            .bind(state.day_started_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::Internal(format!("flush rate limit state failed: {e}")))?;
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<LimitState>> {
        let rows = sqlx::query(
            "SELECT api_key_id, server_id, minute_count, minute_started_at, day_count, day_started_at
             FROM rate_limit_state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("load rate limit state failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let server_id: Option<String> = row.get("server_id");
                let minute_started_at: String = row.get("minute_started_at");
                let day_started_at: String = row.get("day_started_at");
                Ok(LimitState {
                    api_key_id: row.get("api_key_id"),
                    server_id: server_id.and_then(|s| s.parse().ok()),
                    minute_count: row.get("minute_count"),
                    minute_started_at: DateTime::parse_from_rfc3339(&minute_started_at)
                        .map_err(|e| GatewayError::Internal(e.to_string()))?
                        .with_timezone(&Utc),
                    day_count: row.get("day_count"),
                    day_started_at: DateTime::parse_from_rfc3339(&day_started_at)
                        .map_err(|e| GatewayError::Internal(e.to_string()))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }
}

pub struct SqliteBreakerStore {
    pool: SqlitePool,
}

impl SqliteBreakerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn state_to_str(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    }
}

#[async_trait]
impl BreakerStore for SqliteBreakerStore {
    async fn save(&self, snapshot: &BreakerSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO circuit_breaker_state
                (server_id, state, failure_count, success_count, total_count, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(server_id) DO UPDATE SET
                state = excluded.state,
                failure_count = excluded.failure_count,
                success_count = excluded.success_count,
                total_count = excluded.total_count,
                opened_at = excluded.opened_at",
        )
        .bind(snapshot.server_id.to_string())
        .bind(state_to_str(snapshot.state))
        .bind(snapshot.failure_count)
        .bind(snapshot.success_count)
        .bind(snapshot.total_count)
        .bind(snapshot.opened_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("save breaker state failed: {e}")))?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<BreakerSnapshot>> {
        let rows = sqlx::query(
            "SELECT server_id, state, failure_count, success_count, total_count, opened_at
             FROM circuit_breaker_state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("load breaker state failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let server_id: String = row.get("server_id");
                let state_str: String = row.get("state");
                let opened_at: Option<String> = row.get("opened_at");
                Ok(BreakerSnapshot {
                    server_id: server_id
                        .parse::<Uuid>()
                        .map_err(|e| GatewayError::Internal(e.to_string()))?,
                    state: match state_str.as_str() {
                        "open" => BreakerState::Open,
                        "half_open" => BreakerState::HalfOpen,
                        _ => BreakerState::Closed,
                    },
                    failure_count: row.get("failure_count"),
                    success_count: row.get("success_count"),
                    total_count: row.get("total_count"),
                    opened_at: opened_at
                        .map(|s| {
                            DateTime::parse_from_rfc3339(&s)
                                .map(|t| t.with_timezone(&Utc))
                                .map_err(|e| GatewayError::Internal(e.to_string()))
                        })
                        .transpose()?,
                })
            })
            .collect()
    }
}

pub struct SqliteWebhookStore {
    pool: SqlitePool,
}

impl SqliteWebhookStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn delivery_status_to_str(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "pending",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Retrying => "retrying",
        DeliveryStatus::Failed => "failed",
    }
}

#[async_trait]
impl WebhookStore for SqliteWebhookStore {
    async fn save_subscription(&self, subscription: &WebhookSubscription) -> Result<()> {
        let event_types_json = serde_json::to_string(&subscription.event_types)?;
        sqlx::query(
            "INSERT INTO webhook_subscriptions (id, url, event_types_json, secret, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                event_types_json = excluded.event_types_json,
                secret = excluded.secret,
                enabled = excluded.enabled",
        )
        .bind(subscription.id.to_string())
        .bind(&subscription.url)
        .bind(event_types_json)
        .bind(subscription.secret.clone())
        .bind(subscription.enabled)
        .bind(subscription.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("save webhook subscription failed: {e}")))?;
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query("SELECT id, url, event_types_json, secret, enabled, created_at FROM webhook_subscriptions")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewayError::Internal(format!("load webhook subscriptions failed: {e}")))?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let event_types_json: String = row.get("event_types_json");
                let created_at: String = row.get("created_at");
                Ok(WebhookSubscription {
                    id: id.parse().map_err(|e: uuid::Error| GatewayError::Internal(e.to_string()))?,
                    url: row.get("url"),
                    event_types: serde_json::from_str(&event_types_json)?,
                    secret: row.get::<Option<String>, _>("secret"),
                    enabled: row.get("enabled"),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map_err(|e| GatewayError::Internal(e.to_string()))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_deliveries
                (id, subscription_id, event_json, status, attempt_count, last_attempt_at, next_attempt_at,
                 response_status, response_body, error, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                last_attempt_at = excluded.last_attempt_at,
                next_attempt_at = excluded.next_attempt_at,
                response_status = excluded.response_status,
                response_body = excluded.response_body,
                error = excluded.error,
                duration_ms = excluded.duration_ms",
        )
        .bind(delivery.id.to_string())
        .bind(delivery.subscription_id.to_string())
        .bind(delivery.event_json.to_string())
        .bind(delivery_status_to_str(delivery.status))
        .bind(delivery.attempt_count)
        .bind(delivery.last_attempt_at.map(|t| t.to_rfc3339()))
        .bind(delivery.next_attempt_at.map(|t| t.to_rfc3339()))
        .bind(delivery.response_status.map(|v| v as i32))
        .bind(&delivery.response_body)
        .bind(&delivery.error)
        .bind(delivery.duration_ms as i64)
        .bind(delivery.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("save webhook delivery failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_pool;
    use std::collections::HashMap;
    use toolgate_core::registry::AuthConfig;
    use toolgate_core::transport::TransportConfig;

    #[tokio::test]
    async fn server_store_round_trips_a_config() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteServerStore::new(pool);
        let config = ServerConfig::new(
            "fs",
            TransportConfig::Http {
                url: "http://localhost:9000".into(),
                headers: HashMap::new(),
            },
            AuthConfig::None,
        );
        store.upsert(&config).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "fs");
    }

    #[tokio::test]
    async fn cache_store_round_trips_a_value() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteCacheStore::new(pool);
        let entry = CacheEntry {
            value: serde_json::json!({"ok": true}),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            ttl_seconds: 60,
            hit_count: 0,
            last_hit_at: None,
        };
        store.set("k", entry).await;
        let loaded = store.get("k").await.unwrap();
        assert_eq!(loaded.value, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn cache_store_delete_matching_removes_by_like_pattern() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteCacheStore::new(pool);
        let entry = |v: i64| CacheEntry {
            value: serde_json::json!(v),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            ttl_seconds: 60,
            hit_count: 0,
            last_hit_at: None,
        };
        store.set("tool:server-a:read:none", entry(1)).await;
        store.set("tool:server-b:read:none", entry(2)).await;
        store.set("webhook:server-a:hook:none", entry(3)).await;

        let removed = store.delete_matching("tool:%").await;
        assert_eq!(removed, 2);
        assert!(store.get("tool:server-a:read:none").await.is_none());
        assert!(store.get("webhook:server-a:hook:none").await.is_some());
    }

    #[tokio::test]
    async fn cache_store_record_hit_updates_counters() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteCacheStore::new(pool);
        let entry = CacheEntry {
            value: serde_json::json!(1),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
            ttl_seconds: 60,
            hit_count: 0,
            last_hit_at: None,
        };
        store.set("k", entry).await;
        let now = Utc::now();
        store.record_hit("k", 3, now).await;
        let loaded = store.get("k").await.unwrap();
        assert_eq!(loaded.hit_count, 3);
        assert!(loaded.last_hit_at.is_some());
    }

    #[tokio::test]
    async fn cache_store_purges_expired_entries() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteCacheStore::new(pool);
        let entry = CacheEntry {
            value: serde_json::json!(1),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            ttl_seconds: 0,
            hit_count: 0,
            last_hit_at: None,
        };
        store.set("k", entry).await;
        let removed = store.purge_expired().await;
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn webhook_store_round_trips_a_subscription() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteWebhookStore::new(pool);
        let subscription =
            WebhookSubscription::new("https://example.com/hook", vec!["tool.invoked".into()], Some("secret".into()));
        store.save_subscription(&subscription).await.unwrap();
        let loaded = store.list_subscriptions().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].url, "https://example.com/hook");
    }

    #[tokio::test]
    async fn rate_limit_store_round_trips_state() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteRateLimitStore::new(pool);
        let state = LimitState {
            api_key_id: "key-1".into(),
            server_id: Some(Uuid::new_v4()),
            minute_count: 3,
            minute_started_at: Utc::now(),
            day_count: 10,
            day_started_at: Utc::now(),
        };
        store.flush(vec![state.clone()]).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].api_key_id, "key-1");
        assert_eq!(loaded[0].minute_count, 3);
        assert_eq!(loaded[0].server_id, state.server_id);
    }

    #[tokio::test]
    async fn breaker_store_round_trips_a_snapshot() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteBreakerStore::new(pool);
        let snapshot = BreakerSnapshot {
            server_id: Uuid::new_v4(),
            state: BreakerState::Open,
            failure_count: 5,
            success_count: 0,
            total_count: 12,
            opened_at: Some(Utc::now()),
        };
        store.save(&snapshot).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, BreakerState::Open);
        assert_eq!(loaded[0].failure_count, 5);
    }

    #[tokio::test]
    async fn webhook_store_saves_delivery_records() {
        let pool = init_pool(":memory:").await.unwrap();
        let store = SqliteWebhookStore::new(pool);
        let delivery = WebhookDelivery {
            id: uuid::Uuid::new_v4(),
            subscription_id: uuid::Uuid::new_v4(),
            event_json: serde_json::json!({"type": "tool.invoked"}),
            status: DeliveryStatus::Delivered,
            attempt_count: 1,
            last_attempt_at: Some(Utc::now()),
            next_attempt_at: None,
            response_status: Some(200),
            response_body: Some("{\"ok\":true}".to_string()),
            error: None,
            duration_ms: 42,
            created_at: Utc::now(),
        };
        store.save_delivery(&delivery).await.unwrap();
    }
}
