//! Tool-invocation gateway: loads configuration, wires every component
//! together, and serves the HTTP/SSE control plane until a shutdown signal
//! arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use toolgate_api::shutdown::{ShutdownHandler, ShutdownState};
use toolgate_api::{build_router, serve, shutdown, GatewayServices};
use toolgate_cache::TwoTierCache;
use toolgate_core::{
    CircuitBreakerRegistry, ConnectionPool, EventBus, GatewayConfig, GatewayMetrics, RateLimiter, ResponseCache,
    Router, ServerRegistry, TokenCache, ToolRegistry,
};
use toolgate_persistence::{
    init_pool, SqliteBreakerStore, SqliteCacheStore, SqliteRateLimitStore, SqliteServerStore, SqliteWebhookStore,
};
use toolgate_webhooks::{RetryPolicy, WebhookDispatcher};

#[derive(Parser, Debug)]
#[command(name = "toolgate-server", about = "Tool-invocation gateway")]
struct Cli {
    /// Path to a config.toml overriding the compiled defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(node_env = %config.node_env, "starting toolgate-server");

    let pool = init_pool(&config.db_path).await?;

    let events = Arc::new(EventBus::new());
    let token_cache = Arc::new(TokenCache::new());
    let connection_pool = Arc::new(ConnectionPool::new(token_cache, events.clone()));

    let servers = Arc::new(ServerRegistry::load(Box::new(SqliteServerStore::new(pool.clone()))).await?);
    let tools = Arc::new(ToolRegistry::new());
    let breakers = Arc::new(CircuitBreakerRegistry::load(Arc::new(SqliteBreakerStore::new(pool.clone()))).await?);
    let limiter = Arc::new(RateLimiter::load(Arc::new(SqliteRateLimitStore::new(pool.clone()))).await?);
    let cache = Arc::new(TwoTierCache::new(Arc::new(SqliteCacheStore::new(pool.clone()))));
    let response_cache: Arc<dyn ResponseCache> = cache.clone();
    let metrics = Arc::new(GatewayMetrics::new());

    let webhook_policy = RetryPolicy {
        retry_count: config.webhooks.retry_count,
        retry_delay_ms: config.webhooks.retry_delay_ms,
        timeout_ms: config.webhooks.timeout_ms,
    };
    let webhooks = Arc::new(
        WebhookDispatcher::load(Arc::new(SqliteWebhookStore::new(pool.clone())), webhook_policy).await?,
    );

    for server in servers.list().await {
        if server.enabled {
            if let Err(e) = connection_pool.connect(&server).await {
                tracing::warn!(server = %server.name, error = %e, "failed to connect at startup");
            }
            connection_pool.clone().spawn_health_check(server);
        }
    }

    let router = Arc::new(Router::new(
        servers.clone(),
        tools.clone(),
        connection_pool.clone(),
        breakers.clone(),
        limiter.clone(),
        response_cache.clone(),
        events.clone(),
        metrics.clone(),
    ));

    let _flush_handle = limiter.clone().spawn_flush_task();
    let _purge_handle = cache.clone().spawn_purge_task_with_interval(std::time::Duration::from_secs(
        config.cache.purge_interval_secs,
    ));
    let _webhook_handle = webhooks.clone().spawn(events.clone());

    let shutdown_state = Arc::new(ShutdownState::new());

    let services = Arc::new(GatewayServices {
        servers,
        tools,
        pool: connection_pool.clone(),
        breakers,
        limiter: limiter.clone(),
        cache: response_cache,
        events,
        router,
        webhooks: webhooks.clone(),
        metrics,
        config: config.clone(),
        shutdown: shutdown_state.clone(),
    });

    let app = build_router(services);
    let shutdown_token = CancellationToken::new();
    let drain_timeout_ms = config.shutdown.drain_timeout_ms;
    let force_timeout_ms = config.shutdown.force_timeout_ms;

    let shutdown_handlers: Vec<ShutdownHandler> = vec![
        ("webhooks", Box::pin(async move { webhooks.stop() })),
        (
            "rate-limiter-flush",
            Box::pin(async move {
                if let Err(e) = limiter.flush().await {
                    tracing::warn!(error = %e, "rate limiter flush failed during shutdown");
                }
            }),
        ),
        (
            "cache-purge",
            Box::pin(async move {
                cache.purge_now().await;
            }),
        ),
        (
            "connections-close",
            Box::pin(async move {
                connection_pool.disconnect_all().await;
            }),
        ),
        (
            "db-pool-close",
            Box::pin(async move {
                pool.close().await;
            }),
        ),
    ];

    let coordinator_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown::coordinate(
            coordinator_token,
            drain_timeout_ms,
            force_timeout_ms,
            shutdown_state,
            shutdown_handlers,
        )
        .await;
    });

    serve(&config.http.bind_address, config.http.port, app, shutdown_token).await?;

    info!("toolgate-server stopped");
    Ok(())
}
