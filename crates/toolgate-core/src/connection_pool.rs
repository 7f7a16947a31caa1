//! Connection Pool (C3): one live connection per enabled server, with
//! periodic health checks folded in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::event_bus::{EventBus, GatewayEvent};
use crate::registry::ServerConfig;
use crate::token_cache::TokenCache;
use crate::transport::{build_transport, DownstreamTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

struct Connection {
    status: ConnectionStatus,
    client: Option<Arc<dyn DownstreamTransport>>,
    last_health_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    error: Option<String>,
}

impl Connection {
    fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            client: None,
            last_health_check: None,
            consecutive_failures: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub server_id: Uuid,
    pub status: ConnectionStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Holds at most one live downstream connection per server. A per-server
/// latch serializes `connect` so concurrent callers don't race to spawn two
/// child processes for the same stdio server.
pub struct ConnectionPool {
    token_cache: Arc<TokenCache>,
    events: Arc<EventBus>,
    connections: RwLock<HashMap<Uuid, Connection>>,
    latches: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConnectionPool {
    pub fn new(token_cache: Arc<TokenCache>, events: Arc<EventBus>) -> Self {
        Self {
            token_cache,
            events,
            connections: RwLock::new(HashMap::new()),
            latches: Mutex::new(HashMap::new()),
        }
    }

    async fn latch_for(&self, server_id: Uuid) -> Arc<Mutex<()>> {
        let mut latches = self.latches.lock().await;
        latches.entry(server_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn connect(&self, config: &ServerConfig) -> Result<()> {
        let latch = self.latch_for(config.id).await;
        let _guard = latch.lock().await;

        {
            let connections = self.connections.read().await;
            if let Some(conn) = connections.get(&config.id) {
                if conn.status == ConnectionStatus::Connected {
                    return Ok(());
                }
            }
        }

        self.set_status(config.id, ConnectionStatus::Connecting, None).await;

        let auth = self.token_cache.resolve(config.id, &config.auth).await?;
        let transport = build_transport(&config.transport, &auth);

        match transport {
            Ok(transport) => {
                let mut connections = self.connections.write().await;
                let conn = connections.entry(config.id).or_insert_with(Connection::disconnected);
                conn.status = ConnectionStatus::Connected;
                conn.client = Some(Arc::from(transport));
                conn.error = None;
                conn.consecutive_failures = 0;
                drop(connections);
                self.events.emit(GatewayEvent::ServerConnected {
                    server_id: config.id,
                    server_name: config.name.clone(),
                });
                info!(server = %config.name, "connected");
                Ok(())
            }
            Err(err) => {
                self.set_status(config.id, ConnectionStatus::Error, Some(err.to_string())).await;
                self.events.emit(GatewayEvent::ServerError {
                    server_id: config.id,
                    server_name: config.name.clone(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    pub async fn disconnect(&self, server_id: Uuid, server_name: &str) -> Result<()> {
        let latch = self.latch_for(server_id).await;
        let _guard = latch.lock().await;

        let client = {
            let mut connections = self.connections.write().await;
            connections.get_mut(&server_id).and_then(|c| c.client.take())
        };
        if let Some(client) = client {
            let _ = client.close().await;
        }
        self.set_status(server_id, ConnectionStatus::Disconnected, None).await;
        self.events.emit(GatewayEvent::ServerDisconnected {
            server_id,
            server_name: server_name.to_string(),
        });
        Ok(())
    }

    /// Closes every live client without emitting disconnect events, for
    /// graceful shutdown where nothing is listening on the event bus anymore.
    pub async fn disconnect_all(&self) {
        let ids: Vec<Uuid> = self.connections.read().await.keys().copied().collect();
        for id in ids {
            let client = {
                let mut connections = self.connections.write().await;
                connections.get_mut(&id).and_then(|c| c.client.take())
            };
            if let Some(client) = client {
                let _ = client.close().await;
            }
            self.set_status(id, ConnectionStatus::Disconnected, None).await;
        }
    }

    async fn set_status(&self, server_id: Uuid, status: ConnectionStatus, error: Option<String>) {
        let mut connections = self.connections.write().await;
        let conn = connections.entry(server_id).or_insert_with(Connection::disconnected);
        conn.status = status;
        conn.error = error;
    }

    pub async fn get_client(&self, server_id: Uuid) -> Result<Arc<dyn DownstreamTransport>> {
        let connections = self.connections.read().await;
        match connections.get(&server_id) {
            Some(conn) if conn.status == ConnectionStatus::Connected => {
                conn.client.clone().ok_or_else(|| GatewayError::NotConnected(server_id.to_string()))
            }
            _ => Err(GatewayError::NotConnected(server_id.to_string())),
        }
    }

    pub async fn get_connection_status(&self, server_id: Uuid) -> ConnectionStatus {
        self.connections
            .read()
            .await
            .get(&server_id)
            .map(|c| c.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub async fn get_all_connections(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(id, c)| ConnectionSnapshot {
                server_id: *id,
                status: c.status,
                last_health_check: c.last_health_check,
                error: c.error.clone(),
            })
            .collect()
    }

    /// Runs one health-check pass over `config`'s connection: pings if
    /// connected, tracks consecutive failures, and disconnects after 3
    /// straight misses so the router stops routing to it.
    async fn check_health(&self, config: &ServerConfig) {
        let client = {
            let connections = self.connections.read().await;
            connections.get(&config.id).and_then(|c| c.client.clone())
        };
        let Some(client) = client else { return };

        let timeout = Duration::from_millis(config.health_check.timeout_ms);
        let outcome = tokio::time::timeout(timeout, client.ping()).await;

        let mut connections = self.connections.write().await;
        let conn = connections.entry(config.id).or_insert_with(Connection::disconnected);
        conn.last_health_check = Some(Utc::now());

        match outcome {
            Ok(Ok(())) => {
                conn.consecutive_failures = 0;
            }
            Ok(Err(e)) => {
                conn.consecutive_failures += 1;
                conn.error = Some(e.to_string());
            }
            Err(_) => {
                conn.consecutive_failures += 1;
                conn.error = Some("health check timed out".to_string());
            }
        }

        if conn.consecutive_failures >= 3 && conn.status == ConnectionStatus::Connected {
            conn.status = ConnectionStatus::Error;
            let message = conn.error.clone().unwrap_or_default();
            drop(connections);
            warn!(server = %config.name, "health check failed 3 times, marking connection errored");
            self.events.emit(GatewayEvent::ServerError {
                server_id: config.id,
                server_name: config.name.clone(),
                message,
            });
        }
    }

    /// Spawns the periodic health-check loop for one server. The caller
    /// keeps the `JoinHandle` and aborts it when the server is unregistered
    /// or disabled.
    pub fn spawn_health_check(self: Arc<Self>, config: ServerConfig) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !config.health_check.enabled {
                return;
            }
            let mut interval = tokio::time::interval(Duration::from_millis(config.health_check.interval_ms));
            loop {
                interval.tick().await;
                self.check_health(&config).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AuthConfig;
    use crate::transport::TransportConfig;
    use std::collections::HashMap as Map;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(Arc::new(TokenCache::new()), Arc::new(EventBus::new()))
    }

    fn http_config(name: &str) -> ServerConfig {
        ServerConfig::new(
            name,
            TransportConfig::Http {
                url: "http://127.0.0.1:1".into(),
                headers: Map::new(),
            },
            AuthConfig::None,
        )
    }

    #[tokio::test]
    async fn unconnected_server_reports_disconnected() {
        let pool = pool();
        let status = pool.get_connection_status(Uuid::new_v4()).await;
        assert_eq!(status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn http_transport_connects_eagerly_without_dialing() {
        let pool = pool();
        let config = http_config("fs");
        pool.connect(&config).await.unwrap();
        assert_eq!(pool.get_connection_status(config.id).await, ConnectionStatus::Connected);
        assert!(pool.get_client(config.id).await.is_ok());
    }

    #[tokio::test]
    async fn disconnect_clears_the_client() {
        let pool = pool();
        let config = http_config("fs");
        pool.connect(&config).await.unwrap();
        pool.disconnect(config.id, &config.name).await.unwrap();
        assert_eq!(pool.get_connection_status(config.id).await, ConnectionStatus::Disconnected);
        assert!(pool.get_client(config.id).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_all_clears_every_connection() {
        let pool = pool();
        let a = http_config("fs-a");
        let b = http_config("fs-b");
        pool.connect(&a).await.unwrap();
        pool.connect(&b).await.unwrap();
        pool.disconnect_all().await;
        assert_eq!(pool.get_connection_status(a.id).await, ConnectionStatus::Disconnected);
        assert_eq!(pool.get_connection_status(b.id).await, ConnectionStatus::Disconnected);
    }
}
