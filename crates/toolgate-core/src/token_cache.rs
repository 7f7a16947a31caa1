//! Token Cache (C2): obtains and refreshes auth material per server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::registry::AuthConfig;
use crate::transport::ResolvedAuth;

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// One entry per server, guarded by its own lock so refreshing server A's
/// token never blocks a concurrent read of server B's.
pub struct TokenCache {
    client: reqwest::Client,
    entries: Mutex<HashMap<Uuid, Arc<Mutex<Option<CachedToken>>>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the headers to attach to a downstream connection for the
    /// given server's auth descriptor, refreshing an OAuth2 token if the
    /// cached one is missing or within 30s of expiry.
    pub async fn resolve(&self, server_id: Uuid, auth: &AuthConfig) -> Result<ResolvedAuth> {
        match auth {
            AuthConfig::None => Ok(ResolvedAuth::default()),
            AuthConfig::ApiKey { header, prefix, key } => {
                let value = match prefix {
                    Some(p) => format!("{p}{key}"),
                    None => key.clone(),
                };
                let mut headers = HashMap::new();
                headers.insert(header.clone(), value);
                Ok(ResolvedAuth { headers })
            }
            AuthConfig::OAuth2 {
                client_id,
                client_secret,
                token_url,
                scopes,
            } => {
                let token = self.oauth2_token(server_id, token_url, client_id, client_secret, scopes).await?;
                let mut headers = HashMap::new();
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                Ok(ResolvedAuth { headers })
            }
        }
    }

    async fn oauth2_token(
        &self,
        server_id: Uuid,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> Result<String> {
        let lock = {
            let mut entries = self.entries.lock().await;
            entries
                .entry(server_id)
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        let mut guard = lock.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() + Duration::from_secs(30) {
                return Ok(cached.access_token.clone());
            }
        }

        let resp = self
            .client
            .post(token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("scope", &scopes.join(" ")),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(format!("token refresh failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(GatewayError::AuthError(format!("token endpoint returned {}", resp.status())));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamFailure(format!("invalid token response: {e}")))?;

        let cached = CachedToken {
            access_token: body.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        };
        *guard = Some(cached);
        Ok(body.access_token)
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn api_key_auth_resolves_without_network() {
        let cache = TokenCache::new();
        let auth = AuthConfig::ApiKey {
            header: "X-Api-Key".into(),
            prefix: None,
            key: "secret".into(),
        };
        let resolved = cache.resolve(Uuid::new_v4(), &auth).await.unwrap();
        assert_eq!(resolved.headers.get("X-Api-Key"), Some(&"secret".to_string()));
    }

    #[tokio::test]
    async fn none_auth_resolves_to_empty_headers() {
        let cache = TokenCache::new();
        let resolved = cache.resolve(Uuid::new_v4(), &AuthConfig::None).await.unwrap();
        assert!(resolved.headers.is_empty());
    }
}
