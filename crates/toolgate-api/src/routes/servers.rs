use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use toolgate_core::{AuthConfig, ConnectionSnapshot, GatewayEvent, ServerConfig, TransportConfig};

use crate::error::ApiError;
use crate::state::GatewayServices;

pub async fn list_servers(State(services): State<Arc<GatewayServices>>) -> Json<Vec<ServerConfig>> {
    Json(services.servers.list().await)
}

pub async fn list_connections(State(services): State<Arc<GatewayServices>>) -> Json<Vec<ConnectionSnapshot>> {
    Json(services.pool.get_all_connections().await)
}

#[derive(Debug, Deserialize)]
pub struct RegisterServerBody {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_auth")]
    pub auth: AuthConfig,
}

fn default_auth() -> AuthConfig {
    AuthConfig::None
}

pub async fn register_server(
    State(services): State<Arc<GatewayServices>>,
    Json(body): Json<RegisterServerBody>,
) -> Result<Json<ServerConfig>, ApiError> {
    let config = ServerConfig::new(&body.name, body.transport, body.auth);
    let registered = services.servers.register(config).await?;
    services.pool.connect(&registered).await?;
    services.pool.clone().spawn_health_check(registered.clone());
    services.events.emit(GatewayEvent::ServerCreated {
        server_id: registered.id,
        server_name: registered.name.clone(),
    });
    Ok(Json(registered))
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledBody {
    pub enabled: bool,
}

pub async fn set_server_enabled(
    State(services): State<Arc<GatewayServices>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetEnabledBody>,
) -> Result<Json<HashMap<String, bool>>, ApiError> {
    services.servers.set_enabled(&id, body.enabled).await?;

    let server = services
        .servers
        .get(&id)
        .await
        .ok_or_else(|| toolgate_core::GatewayError::NotFound(id.to_string()))?;

    if body.enabled {
        services.pool.connect(&server).await?;
    } else {
        services.pool.disconnect(id, &server.name).await?;
    }
    services.events.emit(GatewayEvent::ServerUpdated {
        server_id: id,
        server_name: server.name,
    });

    let mut response = HashMap::new();
    response.insert("enabled".to_string(), body.enabled);
    Ok(Json(response))
}
