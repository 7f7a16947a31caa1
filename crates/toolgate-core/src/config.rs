//! Gateway configuration: compiled defaults, layered with an optional
//! `config.toml` and then environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout_ms: u64,
    pub force_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 30_000,
            force_timeout_ms: 45_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultRateLimits {
    pub per_minute: u32,
    pub per_day: u32,
}

impl Default for DefaultRateLimits {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_day: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookDefaults {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for WebhookDefaults {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay_ms: 1_000,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_capacity: usize,
    pub default_ttl_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1_000,
            default_ttl_secs: 300,
            purge_interval_secs: 300,
        }
    }
}

/// Top-level gateway configuration. Layered as:
/// compiled defaults -> `config.toml` -> environment variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub http: HttpConfig,
    pub shutdown: ShutdownConfig,
    pub default_rate_limits: DefaultRateLimits,
    pub webhooks: WebhookDefaults,
    pub cache: CacheConfig,
    pub db_path: String,
    pub log_level: String,
    pub node_env: String,
}

impl GatewayConfig {
    /// Loads defaults, merges in `path` if it exists, then applies
    /// environment variable overrides. A missing config file is not an
    /// error; an unparsable one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::with_fallback_defaults();

        if let Some(path) = path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| GatewayError::ValidationError(format!("failed to read {}: {e}", path.display())))?;
                config = toml::from_str(&raw)
                    .map_err(|e| GatewayError::ValidationError(format!("failed to parse {}: {e}", path.display())))?;
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn with_fallback_defaults() -> Self {
        let mut config = Self::default();
        config.db_path = "toolgate.db".to_string();
        config.log_level = "info".to_string();
        config.node_env = "development".to_string();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TOOLGATE_HTTP_BIND_ADDRESS") {
            self.http.bind_address = v;
        }
        if let Ok(v) = std::env::var("TOOLGATE_HTTP_PORT").and_then(|v| v.parse::<u16>().map_err(|_| std::env::VarError::NotPresent)) {
            self.http.port = v;
        }
        if let Ok(v) = std::env::var("DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("NODE_ENV") {
            self.node_env = v;
        }
        if let Ok(v) = std::env::var("TOOLGATE_SHUTDOWN_DRAIN_MS").and_then(|v| v.parse::<u64>().map_err(|_| std::env::VarError::NotPresent)) {
            self.shutdown.drain_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("TOOLGATE_SHUTDOWN_FORCE_MS").and_then(|v| v.parse::<u64>().map_err(|_| std::env::VarError::NotPresent)) {
            self.shutdown.force_timeout_ms = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.http.port == 0 {
            return Err(GatewayError::ValidationError("http.port must be nonzero".into()));
        }
        if self.shutdown.force_timeout_ms <= self.shutdown.drain_timeout_ms {
            return Err(GatewayError::ValidationError(
                "shutdown.force_timeout_ms must exceed shutdown.drain_timeout_ms".into(),
            ));
        }
        if self.db_path.is_empty() {
            return Err(GatewayError::ValidationError("db_path must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::with_fallback_defaults();
        config.validate().unwrap();
    }

    #[test]
    fn load_with_no_file_falls_back_to_defaults() {
        let config = GatewayConfig::load(None).unwrap();
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.db_path, "toolgate.db");
    }

    #[test]
    fn load_parses_a_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "db_path = \"custom.db\"\n[http]\nport = 9090\n").unwrap();
        let config = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(config.db_path, "custom.db");
        assert_eq!(config.http.port, 9090);
    }

    #[test]
    fn rejects_inverted_shutdown_deadlines() {
        let mut config = GatewayConfig::with_fallback_defaults();
        config.shutdown.drain_timeout_ms = 50_000;
        config.shutdown.force_timeout_ms = 10_000;
        assert!(config.validate().is_err());
    }
}
