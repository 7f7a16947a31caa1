//! Shared service container wired together by the binary entrypoint and
//! threaded through every handler via `axum::extract::State`.

use std::sync::Arc;

use toolgate_core::{
    CircuitBreakerRegistry, ConnectionPool, EventBus, GatewayConfig, GatewayMetrics, RateLimiter, ResponseCache,
    Router, ServerRegistry, ToolRegistry,
};
use toolgate_webhooks::WebhookDispatcher;

use crate::shutdown::ShutdownState;

#[derive(Clone)]
pub struct GatewayServices {
    pub servers: Arc<ServerRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<dyn ResponseCache>,
    pub events: Arc<EventBus>,
    pub router: Arc<Router>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub metrics: Arc<GatewayMetrics>,
    pub config: GatewayConfig,
    pub shutdown: Arc<ShutdownState>,
}
