use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use toolgate_core::error::GatewayError;
use toolgate_core::{InvokeOutcome, InvokeRequest};

use crate::error::ApiError;
use crate::state::GatewayServices;

#[derive(Debug, Deserialize)]
pub struct InvokeBody {
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub bypass_cache: bool,
}

pub async fn list_tools(State(services): State<Arc<GatewayServices>>) -> Json<Vec<toolgate_core::ToolEntry>> {
    Json(services.tools.list().await)
}

pub async fn invoke_tool(
    State(services): State<Arc<GatewayServices>>,
    Path(qualified_name): Path<String>,
    Json(body): Json<InvokeBody>,
) -> Result<impl IntoResponse, ApiError> {
    if services.shutdown.is_draining() {
        return Err(ApiError(GatewayError::ServiceUnavailable));
    }
    let outcome = services
        .router
        .invoke(InvokeRequest {
            api_key_id: body.api_key_id.unwrap_or_else(|| "anonymous".to_string()),
            qualified_name,
            params: body.params,
            bypass_cache: body.bypass_cache,
        })
        .await?;
    let mut headers = HeaderMap::new();
    headers.insert("X-RateLimit-Remaining-Minute", outcome.minute_remaining.into());
    headers.insert("X-RateLimit-Remaining-Day", outcome.day_remaining.into());
    Ok((headers, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequestItem {
    pub qualified_name: String,
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub bypass_cache: bool,
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub requests: Vec<BatchRequestItem>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchResultItem {
    Ok(InvokeOutcome),
    Err { error: String },
}

pub async fn invoke_batch(
    State(services): State<Arc<GatewayServices>>,
    Json(body): Json<BatchBody>,
) -> Result<Json<Vec<BatchResultItem>>, ApiError> {
    if services.shutdown.is_draining() {
        return Err(ApiError(GatewayError::ServiceUnavailable));
    }
    let requests = body
        .requests
        .into_iter()
        .map(|item| InvokeRequest {
            api_key_id: item.api_key_id.unwrap_or_else(|| "anonymous".to_string()),
            qualified_name: item.qualified_name,
            params: item.params,
            bypass_cache: item.bypass_cache,
        })
        .collect();

    let outcomes = services
        .router
        .invoke_batch(requests)
        .await
        .into_iter()
        .map(|r| match r {
            Ok(outcome) => BatchResultItem::Ok(outcome),
            Err(e) => BatchResultItem::Err { error: e.to_string() },
        })
        .collect();

    Ok(Json(outcomes))
}
