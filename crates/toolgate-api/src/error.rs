//! Maps `GatewayError` onto the HTTP boundary.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use toolgate_core::GatewayError;

pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({ "error": self.0.to_string() });
        let mut headers = HeaderMap::new();
        if let Some(retry_after_ms) = self.0.retry_after_ms() {
            body["retryAfterMs"] = json!(retry_after_ms);
            headers.insert("Retry-After", (retry_after_ms.div_ceil(1000)).into());
        }
        if let GatewayError::RateLimited { minute_remaining, day_remaining, .. } = &self.0 {
            headers.insert("X-RateLimit-Remaining-Minute", (*minute_remaining).into());
            headers.insert("X-RateLimit-Remaining-Day", (*day_remaining).into());
        }
        (status, headers, Json(body)).into_response()
    }
}
