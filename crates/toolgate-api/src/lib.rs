//! HTTP and SSE control plane: routes every external request into the
//! dataplane built by `toolgate-core`.

pub mod error;
pub mod routes;
pub mod shutdown;
pub mod sse;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use state::GatewayServices;

pub fn build_router(services: Arc<GatewayServices>) -> Router {
    Router::new()
        .route("/health", get(routes::health::liveness))
        .route("/health/ready", get(routes::health::readiness))
        .route("/metrics", get(routes::health::metrics))
        .route("/tools", get(routes::tools::list_tools))
        .route("/tools/batch", post(routes::tools::invoke_batch))
        .route("/tools/{qualifiedName}/invoke", post(routes::tools::invoke_tool))
        .route("/servers", get(routes::servers::list_servers).post(routes::servers::register_server))
        .route("/servers/connections", get(routes::servers::list_connections))
        .route("/servers/{id}/enabled", put(routes::servers::set_server_enabled))
        .route("/webhooks", get(routes::webhooks::list_webhooks).post(routes::webhooks::register_webhook))
        .route("/webhooks/test", post(routes::webhooks::test_webhook))
        .route("/sse/events", get(sse::sse_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(services)
}

/// Binds and serves `app`, running until `shutdown_token` is cancelled.
pub async fn serve(bind_address: &str, port: u16, app: Router, shutdown_token: CancellationToken) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .expect("bind_address and port must form a valid socket address");
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await
}
