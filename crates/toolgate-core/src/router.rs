//! Router (C9): orchestrates a single tool invocation end to end.
//!
//! Order of operations, per invocation:
//! 1. resolve the qualified tool name against the tool registry
//! 2. check the server's circuit breaker
//! 3. check the caller's rate limit
//! 4. check the response cache
//! 5. dispatch to the downstream connection
//! 6. record success/failure against the breaker and emit an event

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::connection_pool::ConnectionPool;
use crate::error::{GatewayError, Result};
use crate::event_bus::{EventBus, GatewayEvent};
use crate::metrics::GatewayMetrics;
use crate::rate_limiter::{LimitKey, RateLimiter};
use crate::registry::ServerRegistry;
use crate::tool_registry::ToolRegistry;

/// Two-tier response cache seam (C5), implemented by `toolgate-cache`.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value, ttl_secs: u64);
}

pub struct InvokeRequest {
    pub api_key_id: String,
    pub qualified_name: String,
    pub params: Value,
    pub bypass_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeOutcome {
    pub server_id: Uuid,
    pub qualified_name: String,
    pub result: Value,
    pub cache_hit: bool,
    pub duration_ms: u64,
    pub minute_remaining: u32,
    pub day_remaining: u32,
}

pub struct Router {
    servers: Arc<ServerRegistry>,
    tools: Arc<ToolRegistry>,
    pool: Arc<ConnectionPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    cache: Arc<dyn ResponseCache>,
    events: Arc<EventBus>,
    metrics: Arc<GatewayMetrics>,
}

impl Router {
    pub fn new(
        servers: Arc<ServerRegistry>,
        tools: Arc<ToolRegistry>,
        pool: Arc<ConnectionPool>,
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<RateLimiter>,
        cache: Arc<dyn ResponseCache>,
        events: Arc<EventBus>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            servers,
            tools,
            pool,
            breakers,
            limiter,
            cache,
            events,
            metrics,
        }
    }

    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeOutcome> {
        let started = Instant::now();

        let tool = self
            .tools
            .resolve(&request.qualified_name)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("tool '{}'", request.qualified_name)))?;

        let server_id: Uuid = tool
            .server_id
            .parse()
            .map_err(|_| GatewayError::Internal(format!("tool '{}' has a malformed server id", tool.qualified_name)))?;
        let server = self
            .servers
            .get(&server_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("server '{}'", tool.server_name)))?;
        if !server.enabled {
            return Err(GatewayError::NotConnected(server.name.clone()));
        }

        self.breakers.guard(server_id).await?;

        let limit_key = LimitKey::new(&request.api_key_id, Some(server_id));
        let (minute_remaining, day_remaining) =
            match self.limiter.check_and_increment(&limit_key, &server.rate_limits).await {
                Ok(remaining) => remaining,
                Err(err) => {
                    if let GatewayError::RateLimited { minute_remaining, .. } = &err {
                        let window = if *minute_remaining == 0 { "minute" } else { "day" };
                        self.metrics.record_rate_limit_rejection(window);
                    }
                    return Err(err);
                }
            };

        let cache_key = cache_key("tool", server_id, &tool.tool_name, &request.params);
        if !request.bypass_cache {
            if let Some(cached) = self.cache.get(&cache_key).await {
                self.metrics.record_cache(true);
                self.metrics.record_invocation("cache_hit");
                self.tools.record_usage(&tool.qualified_name).await;
                return Ok(InvokeOutcome {
                    server_id,
                    qualified_name: tool.qualified_name.clone(),
                    result: cached,
                    cache_hit: true,
                    duration_ms: started.elapsed().as_millis() as u64,
                    minute_remaining,
                    day_remaining,
                });
            }
            self.metrics.record_cache(false);
        }

        let client = self.pool.get_client(server_id).await?;
        let timeout = std::time::Duration::from_millis(server.invocation_timeout_ms());
        let dispatch = tokio::time::timeout(timeout, client.call_tool(&tool.tool_name, request.params.clone())).await;

        let outcome = match dispatch {
            Ok(Ok(result)) => {
                self.breakers.record_success(server_id).await?;
                self.tools.record_usage(&tool.qualified_name).await;
                self.cache.set(&cache_key, result.clone(), server.cache_ttl_secs()).await;
                let duration_ms = started.elapsed().as_millis() as u64;
                self.events.emit(GatewayEvent::ToolInvoked {
                    qualified_name: tool.qualified_name.clone(),
                    server_id,
                    duration_ms,
                    cache_hit: false,
                });
                self.metrics.record_invocation("success");
                Ok(InvokeOutcome {
                    server_id,
                    qualified_name: tool.qualified_name.clone(),
                    result,
                    cache_hit: false,
                    duration_ms,
                    minute_remaining,
                    day_remaining,
                })
            }
            Ok(Err(err)) => {
                if err.counts_toward_breaker() {
                    self.breakers.record_failure(server_id).await?;
                }
                self.events.emit(GatewayEvent::ToolError {
                    qualified_name: tool.qualified_name.clone(),
                    server_id,
                    message: err.to_string(),
                });
                self.metrics.record_invocation("error");
                Err(err)
            }
            Err(_) => {
                self.breakers.record_failure(server_id).await?;
                let err = GatewayError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                self.events.emit(GatewayEvent::ToolError {
                    qualified_name: tool.qualified_name.clone(),
                    server_id,
                    message: err.to_string(),
                });
                self.metrics.record_invocation("error");
                Err(err)
            }
        };

        outcome
    }

    /// Runs every request through [`invoke`] concurrently and returns the
    /// results in input order. No partial abort: one caller's failure or
    /// rate limit never blocks the others in the batch.
    pub async fn invoke_batch(&self, requests: Vec<InvokeRequest>) -> Vec<Result<InvokeOutcome>> {
        let futures = requests.into_iter().map(|request| self.invoke(request));
        futures::future::join_all(futures).await
    }
}

/// Builds the `"<type>:<serverId>:<toolName>:<paramsHash>"` cache key from
/// §3: `paramsHash` is the first 16 hex chars of a SHA-256 over params with
/// object keys sorted, so key order never changes the hash. Empty params
/// hash to the literal `"none"`.
pub fn cache_key(cache_type: &str, server_id: Uuid, tool_name: &str, params: &Value) -> String {
    let params_hash = if is_empty_params(params) {
        "none".to_string()
    } else {
        use sha2::{Digest, Sha256};
        let canonical = canonicalize(params).to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())[..16].to_string()
    };
    format!("{cache_type}:{server_id}:{tool_name}:{params_hash}")
}

fn is_empty_params(params: &Value) -> bool {
    matches!(params, Value::Null) || matches!(params, Value::Object(map) if map.is_empty())
}

/// Recursively sorts object keys so structurally-equal params always
/// serialize the same way regardless of insertion order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            serde_json::to_value(sorted).expect("re-serializing a sorted map never fails")
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ToolEntry;
    use crate::registry::{AuthConfig, ServerConfig, ServerStore};
    use crate::token_cache::TokenCache;
    use crate::transport::TransportConfig;
    use std::collections::HashMap;
    use tokio::sync::Mutex as TokioMutex;

    struct NullStore;
    #[async_trait]
    impl ServerStore for NullStore {
        async fn load_all(&self) -> Result<Vec<ServerConfig>> {
            Ok(Vec::new())
        }
        async fn upsert(&self, _config: &ServerConfig) -> Result<()> {
            Ok(())
        }
    }

    struct NullBreakerStore;
    #[async_trait]
    impl crate::circuit_breaker::BreakerStore for NullBreakerStore {
        async fn save(&self, _snapshot: &crate::circuit_breaker::BreakerSnapshot) -> Result<()> {
            Ok(())
        }
        async fn load_all(&self) -> Result<Vec<crate::circuit_breaker::BreakerSnapshot>> {
            Ok(Vec::new())
        }
    }

    struct NullLimitStore;
    #[async_trait]
    impl crate::rate_limiter::RateLimitStore for NullLimitStore {
        async fn flush(&self, _states: Vec<crate::rate_limiter::LimitState>) -> Result<()> {
            Ok(())
        }
        async fn load_all(&self) -> Result<Vec<crate::rate_limiter::LimitState>> {
            Ok(Vec::new())
        }
    }

    struct InMemoryCache(TokioMutex<HashMap<String, Value>>);
    #[async_trait]
    impl ResponseCache for InMemoryCache {
        async fn get(&self, key: &str) -> Option<Value> {
            self.0.lock().await.get(key).cloned()
        }
        async fn set(&self, key: &str, value: Value, _ttl_secs: u64) {
            self.0.lock().await.insert(key.to_string(), value);
        }
    }

    async fn build_router() -> (Router, Uuid, String) {
        let servers = Arc::new(ServerRegistry::load(Box::new(NullStore)).await.unwrap());
        let config = ServerConfig::new(
            "fs",
            TransportConfig::Http {
                url: "http://127.0.0.1:1".into(),
                headers: HashMap::new(),
            },
            AuthConfig::None,
        );
        let config = servers.register(config).await.unwrap();

        let tools = Arc::new(ToolRegistry::new());
        let entry = ToolEntry::new(&config.id.to_string(), &config.name, "read", "reads a file", Value::Null);
        let qualified_name = entry.qualified_name.clone();
        tools.register(entry).await.unwrap();

        let events = Arc::new(EventBus::new());
        let pool = Arc::new(ConnectionPool::new(Arc::new(TokenCache::new()), events.clone()));
        pool.connect(&config).await.unwrap();

        let breakers = Arc::new(CircuitBreakerRegistry::new(Arc::new(NullBreakerStore)));
        let limiter = Arc::new(RateLimiter::new(Arc::new(NullLimitStore)));
        let cache: Arc<dyn ResponseCache> = Arc::new(InMemoryCache(TokioMutex::new(HashMap::new())));

        let metrics = Arc::new(crate::metrics::GatewayMetrics::new());
        let router = Router::new(servers, tools, pool, breakers, limiter, cache, events, metrics);
        (router, config.id, qualified_name)
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let (router, _, _) = build_router().await;
        let err = router
            .invoke(InvokeRequest {
                api_key_id: "k".into(),
                qualified_name: "nope/nope".into(),
                params: Value::Null,
                bypass_cache: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn failing_downstream_counts_toward_the_breaker() {
        let (router, server_id, qualified_name) = build_router().await;
        let result = router
            .invoke(InvokeRequest {
                api_key_id: "k".into(),
                qualified_name,
                params: Value::Null,
                bypass_cache: true,
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            router.breakers.state(server_id).await,
            crate::circuit_breaker::BreakerState::Closed
        );
    }
}
