//! SQLite persistence for server configs, the response cache, rate limit
//! counters, circuit breaker state, and webhook subscriptions/deliveries.

pub mod pool;
pub mod stores;

pub use pool::{init_pool, run_migrations};
pub use stores::{
    SqliteBreakerStore, SqliteCacheStore, SqliteRateLimitStore, SqliteServerStore,
    SqliteWebhookStore,
};
