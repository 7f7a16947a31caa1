use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use toolgate_core::ConnectionStatus;

use crate::state::GatewayServices;

/// Aggregate health: `healthy` iff every connection is live, `degraded` if
/// some are erroring, `unhealthy` if none are connected at all.
pub async fn liveness(State(services): State<Arc<GatewayServices>>) -> impl IntoResponse {
    let connections = services.pool.get_all_connections().await;
    let connected = connections.iter().filter(|c| c.status == ConnectionStatus::Connected).count();
    let erroring = connections.iter().filter(|c| c.status == ConnectionStatus::Error).count();

    let status = if connections.is_empty() {
        "healthy"
    } else if connected == connections.len() {
        "healthy"
    } else if connected > 0 || erroring == 0 {
        "degraded"
    } else {
        "unhealthy"
    };
    let code = if status == "unhealthy" { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
    (code, Json(json!({ "status": status, "connected": connected, "total": connections.len() })))
}

/// Ready iff at least one connection is live, when at least one server is configured.
pub async fn readiness(State(services): State<Arc<GatewayServices>>) -> impl IntoResponse {
    let servers = services.servers.list().await;
    let connections = services.pool.get_all_connections().await;
    let connected = connections.iter().filter(|c| c.status == ConnectionStatus::Connected).count();

    let ready = servers.is_empty() || connected > 0;
    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "serverCount": servers.len(),
            "connectedCount": connected,
        })),
    )
}

/// Prometheus text exposition format.
pub async fn metrics(State(services): State<Arc<GatewayServices>>) -> impl IntoResponse {
    services.metrics.refresh_breaker_gauge(&services.breakers).await;
    (
        [("content-type", "text/plain; version=0.0.4")],
        services.metrics.render(),
    )
}
