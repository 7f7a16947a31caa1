//! Prometheus counters and gauges for the gateway, scraped over `/metrics`.
//!
//! Bring your own `prometheus::Registry`; this module just registers and
//! increments a handful of vectors against it.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::circuit_breaker::{BreakerState, CircuitBreakerRegistry};

pub struct GatewayMetrics {
    registry: Registry,
    invocations_total: IntCounterVec,
    cache_total: IntCounterVec,
    rate_limit_rejections_total: IntCounterVec,
    webhook_deliveries_total: IntCounterVec,
    breaker_state: IntGauge,
    sse_clients: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let invocations_total = IntCounterVec::new(
            Opts::new("gateway_invocations_total", "Tool invocations by outcome"),
            &["outcome"],
        )
        .expect("metric definition is well-formed");
        let cache_total = IntCounterVec::new(Opts::new("gateway_cache_total", "Response cache lookups"), &["result"])
            .expect("metric definition is well-formed");
        let rate_limit_rejections_total = IntCounterVec::new(
            Opts::new("gateway_rate_limit_rejections_total", "Requests rejected by the rate limiter"),
            &["window"],
        )
        .expect("metric definition is well-formed");
        let webhook_deliveries_total = IntCounterVec::new(
            Opts::new("gateway_webhook_deliveries_total", "Webhook delivery attempts by outcome"),
            &["outcome"],
        )
        .expect("metric definition is well-formed");
        let breaker_state = IntGauge::new("gateway_breaker_open_count", "Number of circuit breakers currently open")
            .expect("metric definition is well-formed");
        let sse_clients = IntGauge::new("gateway_sse_clients", "Currently connected SSE clients")
            .expect("metric definition is well-formed");

        registry.register(Box::new(invocations_total.clone())).expect("unique metric name");
        registry.register(Box::new(cache_total.clone())).expect("unique metric name");
        registry
            .register(Box::new(rate_limit_rejections_total.clone()))
            .expect("unique metric name");
        registry
            .register(Box::new(webhook_deliveries_total.clone()))
            .expect("unique metric name");
        registry.register(Box::new(breaker_state.clone())).expect("unique metric name");
        registry.register(Box::new(sse_clients.clone())).expect("unique metric name");

        Self {
            registry,
            invocations_total,
            cache_total,
            rate_limit_rejections_total,
            webhook_deliveries_total,
            breaker_state,
            sse_clients,
        }
    }

    pub fn record_invocation(&self, outcome: &str) {
        self.invocations_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_cache(&self, hit: bool) {
        self.cache_total.with_label_values(&[if hit { "hit" } else { "miss" }]).inc();
    }

    pub fn record_rate_limit_rejection(&self, window: &str) {
        self.rate_limit_rejections_total.with_label_values(&[window]).inc();
    }

    pub fn record_webhook_delivery(&self, outcome: &str) {
        self.webhook_deliveries_total.with_label_values(&[outcome]).inc();
    }

    pub fn sse_client_connected(&self) {
        self.sse_clients.inc();
    }

    pub fn sse_client_disconnected(&self) {
        self.sse_clients.dec();
    }

    /// Refreshes the breaker gauge from the registry's current in-memory states.
    pub async fn refresh_breaker_gauge(&self, breakers: &CircuitBreakerRegistry) {
        let open_count = breakers
            .states()
            .await
            .into_iter()
            .filter(|(_, state)| *state == BreakerState::Open)
            .count();
        self.breaker_state.set(open_count as i64);
    }

    /// Renders every registered metric as Prometheus text exposition.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).expect("text encoding never fails for counters/gauges");
        String::from_utf8(buf).expect("prometheus text encoder emits valid UTF-8")
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerStore;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::Arc;
    use uuid::Uuid;

    struct NullStore;
    #[async_trait]
    impl BreakerStore for NullStore {
        async fn save(&self, _snapshot: &crate::circuit_breaker::BreakerSnapshot) -> Result<()> {
            Ok(())
        }
        async fn load_all(&self) -> Result<Vec<crate::circuit_breaker::BreakerSnapshot>> {
            Ok(vec![])
        }
    }

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = GatewayMetrics::new();
        metrics.record_invocation("success");
        metrics.record_cache(true);
        metrics.record_rate_limit_rejection("minute");

        let text = metrics.render();
        assert!(text.contains("gateway_invocations_total"));
        assert!(text.contains("gateway_cache_total"));
        assert!(text.contains("gateway_rate_limit_rejections_total"));
    }

    #[tokio::test]
    async fn breaker_gauge_counts_open_breakers() {
        let metrics = GatewayMetrics::new();
        let breakers = CircuitBreakerRegistry::new(Arc::new(NullStore));
        let server_id = Uuid::new_v4();
        for _ in 0..10 {
            breakers.record_failure(server_id).await.unwrap();
        }

        metrics.refresh_breaker_gauge(&breakers).await;
        assert!(metrics.render().contains("gateway_breaker_open_count 1"));
    }
}
