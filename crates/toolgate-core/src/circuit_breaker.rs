//! Circuit Breaker Registry (C7): one breaker per server, lazily created.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

const FAILURE_THRESHOLD: u32 = 5;
const SUCCESS_THRESHOLD: u32 = 2;
const OPEN_TIMEOUT_MS: i64 = 60_000;
const VOLUME_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted snapshot of one server's breaker, for `toolgate-persistence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub server_id: Uuid,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_count: u32,
    /// Absolute wall-clock time the breaker last tripped open, non-null iff
    /// it has been OPEN since the last CLOSED transition.
    pub opened_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn save(&self, snapshot: &BreakerSnapshot) -> Result<()>;
    async fn load_all(&self) -> Result<Vec<BreakerSnapshot>>;
}

struct Breaker {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    total_count: u32,
    opened_at: Option<DateTime<Utc>>,
    forced: Option<bool>,
}

impl Breaker {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            total_count: 0,
            opened_at: None,
            forced: None,
        }
    }

    fn can_execute(&mut self) -> bool {
        if let Some(forced) = self.forced {
            return forced;
        }
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed_ms = self
                    .opened_at
                    .map(|t| Utc::now().signed_duration_since(t).num_milliseconds())
                    .unwrap_or(0);
                if elapsed_ms >= OPEN_TIMEOUT_MS {
                    self.state = BreakerState::HalfOpen;
                    self.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.total_count += 1;
        match self.state {
            BreakerState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= SUCCESS_THRESHOLD {
                    self.state = BreakerState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.total_count = 0;
                }
            }
            BreakerState::Closed => {
                self.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&mut self) {
        self.total_count += 1;
        match self.state {
            BreakerState::HalfOpen => {
                self.trip();
            }
            BreakerState::Closed => {
                self.failure_count += 1;
                if self.total_count >= VOLUME_THRESHOLD && self.failure_count >= FAILURE_THRESHOLD {
                    self.trip();
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Utc::now());
        self.success_count = 0;
    }

    fn time_until_retry(&self) -> u64 {
        match (self.state, self.opened_at) {
            (BreakerState::Open, Some(opened_at)) => {
                let elapsed_ms = Utc::now().signed_duration_since(opened_at).num_milliseconds().max(0);
                (OPEN_TIMEOUT_MS - elapsed_ms).max(0) as u64
            }
            _ => 0,
        }
    }

    fn snapshot(&self, server_id: Uuid) -> BreakerSnapshot {
        BreakerSnapshot {
            server_id,
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            total_count: self.total_count,
            opened_at: self.opened_at,
        }
    }
}

/// Registry of per-server breakers. Every state transition is persisted
/// synchronously so a restart resumes with the last known state.
pub struct CircuitBreakerRegistry {
    store: Arc<dyn BreakerStore>,
    breakers: RwLock<HashMap<Uuid, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<dyn BreakerStore>) -> Self {
        Self {
            store,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds the registry from every persisted breaker row, so a restart
    /// resumes with whatever OPEN/HALF_OPEN state was last saved instead of
    /// starting every server CLOSED.
    pub async fn load(store: Arc<dyn BreakerStore>) -> Result<Self> {
        let loaded = store.load_all().await?;
        let mut breakers = HashMap::new();
        for snapshot in loaded {
            breakers.insert(
                snapshot.server_id,
                Breaker {
                    state: snapshot.state,
                    failure_count: snapshot.failure_count,
                    success_count: snapshot.success_count,
                    total_count: snapshot.total_count,
                    opened_at: snapshot.opened_at,
                    forced: None,
                },
            );
        }
        Ok(Self {
            store,
            breakers: RwLock::new(breakers),
        })
    }

    pub async fn can_execute(&self, server_id: Uuid) -> bool {
        let mut breakers = self.breakers.write().await;
        breakers.entry(server_id).or_insert_with(Breaker::closed).can_execute()
    }

    pub async fn record_success(&self, server_id: Uuid) -> Result<()> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(server_id).or_insert_with(Breaker::closed);
        breaker.record_success();
        self.store.save(&breaker.snapshot(server_id)).await
    }

    pub async fn record_failure(&self, server_id: Uuid) -> Result<()> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(server_id).or_insert_with(Breaker::closed);
        breaker.record_failure();
        self.store.save(&breaker.snapshot(server_id)).await
    }

    pub async fn get_time_until_retry(&self, server_id: Uuid) -> u64 {
        self.breakers
            .read()
            .await
            .get(&server_id)
            .map(|b| b.time_until_retry())
            .unwrap_or(0)
    }

    pub async fn state(&self, server_id: Uuid) -> BreakerState {
        self.breakers
            .read()
            .await
            .get(&server_id)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub async fn force_open(&self, server_id: Uuid) -> Result<()> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(server_id).or_insert_with(Breaker::closed);
        breaker.forced = Some(false);
        breaker.trip();
        self.store.save(&breaker.snapshot(server_id)).await
    }

    pub async fn force_close(&self, server_id: Uuid) -> Result<()> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(server_id).or_insert_with(Breaker::closed);
        breaker.forced = Some(true);
        self.store.save(&breaker.snapshot(server_id)).await
    }

    /// Current state of every server a breaker has been created for, for metrics export.
    pub async fn states(&self) -> Vec<(Uuid, BreakerState)> {
        self.breakers.read().await.iter().map(|(id, b)| (*id, b.state)).collect()
    }

    /// Gives an error wrapping the caller needs when a call is refused up front.
    pub async fn guard(&self, server_id: Uuid) -> Result<()> {
        if self.can_execute(server_id).await {
            Ok(())
        } else {
            Err(GatewayError::CircuitOpen {
                server_id: server_id.to_string(),
                retry_after_ms: self.get_time_until_retry(server_id).await,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeStore(StdMutex<Vec<BreakerSnapshot>>);

    #[async_trait]
    impl BreakerStore for FakeStore {
        async fn save(&self, snapshot: &BreakerSnapshot) -> Result<()> {
            self.0.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
        async fn load_all(&self) -> Result<Vec<BreakerSnapshot>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(Arc::new(FakeStore(StdMutex::new(Vec::new()))))
    }

    #[tokio::test]
    async fn trips_open_after_threshold_failures_with_enough_volume() {
        let registry = registry();
        let id = Uuid::new_v4();
        for _ in 0..10 {
            registry.record_failure(id).await.unwrap();
        }
        assert_eq!(registry.state(id).await, BreakerState::Open);
        assert!(!registry.can_execute(id).await);
    }

    #[tokio::test]
    async fn stays_closed_below_volume_threshold() {
        let registry = registry();
        let id = Uuid::new_v4();
        for _ in 0..5 {
            registry.record_failure(id).await.unwrap();
        }
        assert_eq!(registry.state(id).await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.force_open(id).await.unwrap();
        {
            let mut breakers = registry.breakers.write().await;
            let breaker = breakers.get_mut(&id).unwrap();
            breaker.forced = None;
            breaker.state = BreakerState::HalfOpen;
        }
        registry.record_failure(id).await.unwrap();
        assert_eq!(registry.state(id).await, BreakerState::Open);
    }

    #[tokio::test]
    async fn force_close_overrides_open_state() {
        let registry = registry();
        let id = Uuid::new_v4();
        registry.force_open(id).await.unwrap();
        assert!(!registry.can_execute(id).await);
        registry.force_close(id).await.unwrap();
        assert!(registry.can_execute(id).await);
    }
}
