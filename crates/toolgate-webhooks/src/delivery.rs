//! Delivery loop: on every gateway event, fan out to matching subscriptions
//! and retry failed deliveries with exponential backoff, in-process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use toolgate_core::error::Result;
use toolgate_core::event_bus::{EventBus, Envelope};

use crate::signing::sign_payload;
use crate::subscription::WebhookSubscription;

const USER_AGENT: &str = "toolgate/1";
const MAX_RESPONSE_BODY_BYTES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_json: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Persistence seam for subscriptions and their delivery history,
/// implemented by `toolgate-persistence`.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn save_subscription(&self, subscription: &WebhookSubscription) -> Result<()>;
    async fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>>;
    async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay_ms: 1_000,
            timeout_ms: 10_000,
        }
    }
}

struct AttemptOutcome {
    status: u16,
    body: Option<String>,
    duration_ms: u64,
}

pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    client: reqwest::Client,
    subscriptions: RwLock<Vec<WebhookSubscription>>,
    policy: RetryPolicy,
    stopped: AtomicBool,
}

impl WebhookDispatcher {
    pub async fn load(store: Arc<dyn WebhookStore>, policy: RetryPolicy) -> Result<Self> {
        let subscriptions = store.list_subscriptions().await?;
        Ok(Self {
            store,
            client: reqwest::Client::new(),
            subscriptions: RwLock::new(subscriptions),
            policy,
            stopped: AtomicBool::new(false),
        })
    }

    pub async fn register(&self, subscription: WebhookSubscription) -> Result<()> {
        self.store.save_subscription(&subscription).await?;
        self.subscriptions.write().await.push(subscription);
        Ok(())
    }

    pub async fn list(&self) -> Vec<WebhookSubscription> {
        self.subscriptions.read().await.clone()
    }

    /// Stops dispatching new deliveries and abandons any retry backoff still
    /// sleeping, for graceful shutdown. Deliveries already in flight still
    /// record their outcome.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Spawns the event loop that fans every bus event out to matching
    /// subscriptions. The returned handle should be kept alive by the owner.
    pub fn spawn(self: Arc<Self>, events: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => self.clone().fan_out(envelope).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn fan_out(self: Arc<Self>, envelope: Envelope) {
        if self.is_stopped() {
            return;
        }
        let type_name = envelope.event.type_name();
        let matching: Vec<WebhookSubscription> = self
            .subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.wants(type_name))
            .cloned()
            .collect();

        let event_json = match serde_json::to_value(&envelope) {
            Ok(v) => v,
            Err(_) => return,
        };

        for subscription in matching {
            let dispatcher = self.clone();
            let event_json = event_json.clone();
            tokio::spawn(async move {
                dispatcher.deliver_with_retry(&subscription, event_json).await;
            });
        }
    }

    async fn deliver_with_retry(&self, subscription: &WebhookSubscription, event_json: serde_json::Value) {
        let mut delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            subscription_id: subscription.id,
            event_json: event_json.clone(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            response_status: None,
            response_body: None,
            error: None,
            duration_ms: 0,
            created_at: Utc::now(),
        };

        loop {
            delivery.attempt_count += 1;
            delivery.last_attempt_at = Some(Utc::now());

            match self.attempt(subscription, &event_json).await {
                Ok(outcome) => {
                    delivery.status = DeliveryStatus::Delivered;
                    delivery.response_status = Some(outcome.status);
                    delivery.response_body = outcome.body;
                    delivery.error = None;
                    delivery.duration_ms = outcome.duration_ms;
                    let _ = self.store.save_delivery(&delivery).await;
                    return;
                }
                Err(e) if delivery.attempt_count > self.policy.retry_count || self.is_stopped() => {
                    delivery.status = DeliveryStatus::Failed;
                    delivery.error = Some(e.to_string());
                    let _ = self.store.save_delivery(&delivery).await;
                    return;
                }
                Err(e) => {
                    let backoff_ms = self.policy.retry_delay_ms * 2u64.pow(delivery.attempt_count - 1);
                    delivery.status = DeliveryStatus::Retrying;
                    delivery.error = Some(e.to_string());
                    delivery.next_attempt_at = Some(Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64));
                    let _ = self.store.save_delivery(&delivery).await;
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
    }

    /// Builds the outbound `{event, timestamp, data}` envelope: `data` is the
    /// bus event's fields with the `type`/`timestamp` tags stripped, since
    /// those already surface as `event`/`timestamp` at the top level.
    fn build_payload(event_json: &Value) -> Value {
        let event_type = event_json.get("type").and_then(Value::as_str).unwrap_or("unknown").to_string();
        let mut data = event_json.clone();
        if let Value::Object(map) = &mut data {
            map.remove("type");
            map.remove("emitted_at");
        }
        serde_json::json!({
            "event": event_type,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        })
    }

    async fn attempt(&self, subscription: &WebhookSubscription, event_json: &serde_json::Value) -> Result<AttemptOutcome> {
        let payload = Self::build_payload(event_json);
        let event_type = payload["event"].as_str().unwrap_or("unknown").to_string();
        let body = payload.to_string();

        let mut request = self
            .client
            .post(&subscription.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .header("X-Webhook-ID", subscription.id.to_string())
            .header("X-Event-Type", event_type)
            .timeout(Duration::from_millis(self.policy.timeout_ms));

        if let Some(secret) = &subscription.secret {
            let signature = sign_payload(secret, &body);
            request = request.header("X-Signature-256", format!("sha256={signature}"));
        }

        let started = Instant::now();
        let result = request.body(body).send().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let resp = result.map_err(|e| toolgate_core::error::GatewayError::UpstreamFailure(e.to_string()))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        let truncated = if body_text.len() > MAX_RESPONSE_BODY_BYTES {
            body_text.chars().take(MAX_RESPONSE_BODY_BYTES).collect()
        } else {
            body_text
        };

        if status.is_success() {
            Ok(AttemptOutcome {
                status: status.as_u16(),
                body: Some(truncated),
                duration_ms,
            })
        } else {
            Err(toolgate_core::error::GatewayError::UpstreamFailure(format!("HTTP {status}: {truncated}")))
        }
    }

    /// Sends one unsigned-retry test delivery and returns the status code,
    /// without touching delivery history.
    pub async fn test_delivery(&self, subscription: &WebhookSubscription) -> Result<u16> {
        let probe = serde_json::json!({ "type": "webhook.test", "subscription_id": subscription.id });
        self.attempt(subscription, &probe).await.map(|o| o.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use toolgate_core::event_bus::GatewayEvent;

    struct FakeStore {
        subscriptions: StdMutex<Vec<WebhookSubscription>>,
        deliveries: StdMutex<Vec<WebhookDelivery>>,
    }

    #[async_trait]
    impl WebhookStore for FakeStore {
        async fn save_subscription(&self, subscription: &WebhookSubscription) -> Result<()> {
            self.subscriptions.lock().unwrap().push(subscription.clone());
            Ok(())
        }
        async fn list_subscriptions(&self) -> Result<Vec<WebhookSubscription>> {
            Ok(self.subscriptions.lock().unwrap().clone())
        }
        async fn save_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
            self.deliveries.lock().unwrap().push(delivery.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn registering_a_subscription_persists_and_caches_it() {
        let store = Arc::new(FakeStore {
            subscriptions: StdMutex::new(Vec::new()),
            deliveries: StdMutex::new(Vec::new()),
        });
        let dispatcher = WebhookDispatcher::load(store.clone(), RetryPolicy::default()).await.unwrap();
        let sub = WebhookSubscription::new("http://127.0.0.1:1/hook", Vec::new(), Some("secret".into()));
        dispatcher.register(sub).await.unwrap();
        assert_eq!(store.subscriptions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_retries_then_gives_up() {
        let store = Arc::new(FakeStore {
            subscriptions: StdMutex::new(Vec::new()),
            deliveries: StdMutex::new(Vec::new()),
        });
        let dispatcher = Arc::new(
            WebhookDispatcher::load(
                store.clone(),
                RetryPolicy {
                    retry_count: 1,
                    retry_delay_ms: 1,
                    timeout_ms: 200,
                },
            )
            .await
            .unwrap(),
        );
        let sub = WebhookSubscription::new("http://127.0.0.1:1/hook", Vec::new(), Some("secret".into()));
        let event = serde_json::json!({"type": "server.connected"});
        dispatcher.deliver_with_retry(&sub, event).await;
        let deliveries = store.deliveries.lock().unwrap();
        assert_eq!(deliveries.last().unwrap().status, DeliveryStatus::Failed);
        assert_eq!(deliveries.last().unwrap().attempt_count, 2);
        assert!(deliveries.last().unwrap().error.is_some());
    }

    #[tokio::test]
    async fn fan_out_ignores_subscriptions_that_do_not_want_the_event() {
        let store = Arc::new(FakeStore {
            subscriptions: StdMutex::new(Vec::new()),
            deliveries: StdMutex::new(Vec::new()),
        });
        let dispatcher = Arc::new(WebhookDispatcher::load(store.clone(), RetryPolicy::default()).await.unwrap());
        let sub = WebhookSubscription::new("http://127.0.0.1:1/hook", vec!["circuit.opened".into()], Some("secret".into()));
        dispatcher.register(sub).await.unwrap();

        let envelope = Envelope {
            id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            event: GatewayEvent::ServerConnected {
                server_id: Uuid::new_v4(),
                server_name: "fs".into(),
            },
        };
        dispatcher.fan_out(envelope).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.deliveries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stopped_dispatcher_does_not_fan_out() {
        let store = Arc::new(FakeStore {
            subscriptions: StdMutex::new(Vec::new()),
            deliveries: StdMutex::new(Vec::new()),
        });
        let dispatcher = Arc::new(WebhookDispatcher::load(store.clone(), RetryPolicy::default()).await.unwrap());
        let sub = WebhookSubscription::new("http://127.0.0.1:1/hook", Vec::new(), None);
        dispatcher.register(sub).await.unwrap();
        dispatcher.stop();

        let envelope = Envelope {
            id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            event: GatewayEvent::ServerConnected {
                server_id: Uuid::new_v4(),
                server_name: "fs".into(),
            },
        };
        dispatcher.fan_out(envelope).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.deliveries.lock().unwrap().is_empty());
    }

    #[test]
    fn build_payload_strips_type_and_nests_the_rest_under_data() {
        let event_json = serde_json::json!({
            "id": "abc",
            "emitted_at": "2026-01-01T00:00:00Z",
            "type": "server.connected",
            "server_id": "11111111-1111-1111-1111-111111111111",
            "server_name": "fs",
        });
        let payload = WebhookDispatcher::build_payload(&event_json);
        assert_eq!(payload["event"], "server.connected");
        assert!(payload["data"].get("type").is_none());
        assert!(payload["data"].get("emitted_at").is_none());
        assert_eq!(payload["data"]["server_name"], "fs");
    }
}
