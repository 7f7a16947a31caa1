//! Webhook subscription data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    /// Event `type_name()`s this subscription wants, or empty for all events.
    pub event_types: Vec<String>,
    /// HMAC signing key. When absent, deliveries carry no `X-Signature-256` header.
    pub secret: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn new(url: &str, event_types: Vec<String>, secret: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            event_types,
            secret,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn wants(&self, event_type: &str) -> bool {
        self.enabled && (self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type))
    }
}
