//! Server Registry (C1): persisted server configs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::transport::TransportConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    ApiKey {
        header: String,
        prefix: Option<String>,
        key: String,
    },
    OAuth2 {
        client_id: String,
        client_secret: String,
        token_url: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 2_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms < 1000 {
            return Err(GatewayError::ValidationError("healthCheck.intervalMs must be >= 1000".into()));
        }
        if self.timeout_ms < 100 {
            return Err(GatewayError::ValidationError("healthCheck.timeoutMs must be >= 100".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_day: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Overrides the default 300s cache TTL for this server's tool responses.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: Uuid,
    pub name: String,
    pub transport: TransportConfig,
    pub auth: AuthConfig,
    pub health_check: HealthCheckConfig,
    pub rate_limits: RateLimitConfig,
    pub metadata: ServerMetadata,
    /// Per design note: default downstream call timeout is
    /// `healthCheck.timeoutMs * 6`, overridable here.
    pub invocation_timeout_ms: Option<u64>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const DEFAULT_TIMEOUT_MULTIPLIER: u64 = 6;
const FALLBACK_INVOCATION_TIMEOUT_MS: u64 = 30_000;

impl ServerConfig {
    pub fn new(name: &str, transport: TransportConfig, auth: AuthConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            transport,
            auth,
            health_check: HealthCheckConfig::default(),
            rate_limits: RateLimitConfig::default(),
            metadata: ServerMetadata::default(),
            invocation_timeout_ms: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn invocation_timeout_ms(&self) -> u64 {
        if let Some(ms) = self.invocation_timeout_ms {
            return ms;
        }
        if self.health_check.enabled {
            self.health_check.timeout_ms * DEFAULT_TIMEOUT_MULTIPLIER
        } else {
            FALLBACK_INVOCATION_TIMEOUT_MS
        }
    }

    pub fn cache_ttl_secs(&self) -> u64 {
        self.metadata.cache_ttl_secs.unwrap_or(300)
    }
}

/// Persistence seam for C1, implemented by `toolgate-persistence`.
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ServerConfig>>;
    async fn upsert(&self, config: &ServerConfig) -> Result<()>;
}

/// In-memory server registry backed by a persistent store. Disabling a
/// server flips `enabled` but never removes its row.
pub struct ServerRegistry {
    store: Box<dyn ServerStore>,
    servers: RwLock<HashMap<Uuid, ServerConfig>>,
}

impl ServerRegistry {
    pub async fn load(store: Box<dyn ServerStore>) -> Result<Self> {
        let loaded = store.load_all().await?;
        let servers = loaded.into_iter().map(|c| (c.id, c)).collect();
        Ok(Self {
            store,
            servers: RwLock::new(servers),
        })
    }

    pub async fn register(&self, config: ServerConfig) -> Result<ServerConfig> {
        config.health_check.validate()?;
        {
            let servers = self.servers.read().await;
            if servers.values().any(|s| s.name == config.name) {
                return Err(GatewayError::NamingConflict(format!(
                    "server name '{}' already in use",
                    config.name
                )));
            }
        }
        self.store.upsert(&config).await?;
        self.servers.write().await.insert(config.id, config.clone());
        Ok(config)
    }

    pub async fn get(&self, id: &Uuid) -> Option<ServerConfig> {
        self.servers.read().await.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<ServerConfig> {
        self.servers.read().await.values().find(|s| s.name == name).cloned()
    }

    pub async fn list(&self) -> Vec<ServerConfig> {
        self.servers.read().await.values().cloned().collect()
    }

    /// Disabling does not delete: flips `enabled` and persists.
    pub async fn set_enabled(&self, id: &Uuid, enabled: bool) -> Result<()> {
        let mut servers = self.servers.write().await;
        let config = servers
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("server {id}")))?;
        config.enabled = enabled;
        config.updated_at = Utc::now();
        self.store.upsert(config).await?;
        Ok(())
    }
}
