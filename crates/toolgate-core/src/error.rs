//! Error taxonomy for the gateway.
//!
//! One enum expresses every failure kind the dataplane can produce. Each
//! variant carries what the HTTP boundary and the circuit breaker need to
//! decide a status code and whether the failure should count against a
//! server's breaker.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("circuit open for {server_id}, retry after {retry_after_ms}ms")]
    CircuitOpen {
        server_id: String,
        retry_after_ms: u64,
    },

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited {
        retry_after_ms: u64,
        minute_remaining: u32,
        day_remaining: u32,
    },

    #[error("server {0} has no live connection")]
    NotConnected(String),

    #[error("service is shutting down, retry the request")]
    ServiceUnavailable,

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("naming conflict: {0}")]
    NamingConflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GatewayError {
    /// HTTP status code this error maps to, per the error taxonomy.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NotFound(_) => 404,
            GatewayError::CircuitOpen { .. } => 503,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::NotConnected(_) => 503,
            GatewayError::ServiceUnavailable => 503,
            GatewayError::UpstreamFailure(_) => 502,
            GatewayError::Timeout { .. } => 504,
            GatewayError::ValidationError(_) => 400,
            GatewayError::AuthError(_) => 401,
            GatewayError::NamingConflict(_) => 409,
            GatewayError::Internal(_) | GatewayError::Io(_) | GatewayError::Serde(_) => 500,
        }
    }

    /// Whether this failure should be recorded against a server's circuit breaker.
    ///
    /// `NotFound`, `ValidationError`, and `AuthError` are caller mistakes, not
    /// signs of a failing downstream, so they never touch breaker counters.
    /// `NotConnected` means there was nothing to call, which is also not a
    /// downstream failure. Cancellation is handled separately by the router,
    /// which simply never calls `record_success`/`record_failure` at all.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamFailure(_) | GatewayError::Timeout { .. } | GatewayError::Internal(_)
        )
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            GatewayError::CircuitOpen { retry_after_ms, .. }
            | GatewayError::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(GatewayError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            GatewayError::CircuitOpen {
                server_id: "s".into(),
                retry_after_ms: 10
            }
            .status_code(),
            503
        );
        assert_eq!(
            GatewayError::RateLimited {
                retry_after_ms: 10,
                minute_remaining: 0,
                day_remaining: 0
            }
            .status_code(),
            429
        );
        assert_eq!(GatewayError::Timeout { elapsed_ms: 1 }.status_code(), 504);
    }

    #[test]
    fn breaker_counting_matches_taxonomy() {
        assert!(!GatewayError::NotFound("x".into()).counts_toward_breaker());
        assert!(!GatewayError::ValidationError("x".into()).counts_toward_breaker());
        assert!(!GatewayError::AuthError("x".into()).counts_toward_breaker());
        assert!(!GatewayError::NotConnected("x".into()).counts_toward_breaker());
        assert!(GatewayError::UpstreamFailure("x".into()).counts_toward_breaker());
        assert!(GatewayError::Timeout { elapsed_ms: 1 }.counts_toward_breaker());
    }
}
