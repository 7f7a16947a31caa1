//! Tool catalog entries, per the `ToolEntry` data model (C4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool exposed by a connected server, keyed by its globally
/// unique qualified name `"<serverName>/<toolName>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    pub qualified_name: String,
    pub server_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    /// Opaque input schema as reported by the downstream server.
    pub input_schema: Value,
    pub category: String,
    pub tags: Vec<String>,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl ToolEntry {
    pub fn new(server_id: &str, server_name: &str, tool_name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            qualified_name: format!("{server_name}/{tool_name}"),
            server_id: server_id.to_string(),
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            description: description.to_string(),
            input_schema,
            category: derive_category(description),
            tags: Vec::new(),
            usage_count: 0,
            last_used_at: None,
            registered_at: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        tags.into_iter().take(5).for_each(|t| self.tags.push(t));
        self
    }

    pub fn record_usage(&mut self, at: DateTime<Utc>) {
        self.usage_count += 1;
        self.last_used_at = Some(at);
    }
}

/// A coarse category derived from a tool's description when the downstream
/// server does not provide one explicitly. Deliberately simple: the first
/// word, lowercased, or "general" when the description is empty.
fn derive_category(description: &str) -> String {
    description
        .split_whitespace()
        .next()
        .map(|w| w.to_lowercase())
        .filter(|w| !w.is_empty())
        .unwrap_or_else(|| "general".to_string())
}
