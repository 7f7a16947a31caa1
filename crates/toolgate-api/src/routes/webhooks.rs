use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use toolgate_webhooks::WebhookSubscription;

use crate::error::ApiError;
use crate::state::GatewayServices;

#[derive(Debug, Deserialize)]
pub struct RegisterWebhookBody {
    pub url: String,
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

pub async fn list_webhooks(State(services): State<Arc<GatewayServices>>) -> Json<Vec<WebhookSubscription>> {
    Json(services.webhooks.list().await)
}

pub async fn register_webhook(
    State(services): State<Arc<GatewayServices>>,
    Json(body): Json<RegisterWebhookBody>,
) -> Result<Json<WebhookSubscription>, ApiError> {
    let subscription = WebhookSubscription::new(&body.url, body.event_types, body.secret);
    services
        .webhooks
        .register(subscription.clone())
        .await
        .map_err(ApiError)?;
    Ok(Json(subscription))
}

pub async fn test_webhook(
    State(services): State<Arc<GatewayServices>>,
    Json(body): Json<RegisterWebhookBody>,
) -> Result<Json<Value>, ApiError> {
    let probe = WebhookSubscription::new(&body.url, body.event_types, body.secret);
    let status = services.webhooks.test_delivery(&probe).await.map_err(ApiError)?;
    Ok(Json(json!({ "status": status })))
}
