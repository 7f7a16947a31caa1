//! Tool Registry (C4): catalog of tools across all connected servers.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::metadata::ToolEntry;

/// Per-connected-server catalog of tools, keyed by qualified name.
///
/// Writers hold the lock exclusively only for the duration of a server's
/// (un)registration; reads (resolve, list, search) take a shared lock.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, tool: ToolEntry) -> Result<()> {
        let mut tools = self.tools.write().await;
        if tools.contains_key(&tool.qualified_name) {
            return Err(GatewayError::NamingConflict(format!(
                "tool '{}' already registered",
                tool.qualified_name
            )));
        }
        tools.insert(tool.qualified_name.clone(), tool);
        Ok(())
    }

    /// Drops every tool entry owned by `server_id`. Called when a server is
    /// unregistered or disconnected, so a ToolEntry never outlives its owner.
    pub async fn unregister_server(&self, server_id: &str) {
        self.tools.write().await.retain(|_, t| t.server_id != server_id);
    }

    pub async fn get(&self, qualified_name: &str) -> Option<ToolEntry> {
        self.tools.read().await.get(qualified_name).cloned()
    }

    /// Resolves by exact qualified-name match, falling back to the first
    /// entry whose qualified name ends with `"/<shortName>"`, per C9 step 1.
    pub async fn resolve(&self, name_or_short: &str) -> Option<ToolEntry> {
        let tools = self.tools.read().await;
        if let Some(entry) = tools.get(name_or_short) {
            return Some(entry.clone());
        }
        let suffix = format!("/{name_or_short}");
        tools.values().find(|t| t.qualified_name.ends_with(&suffix)).cloned()
    }

    pub async fn list(&self) -> Vec<ToolEntry> {
        self.tools.read().await.values().cloned().collect()
    }

    pub async fn list_by_server(&self, server_id: &str) -> Vec<ToolEntry> {
        self.tools
            .read()
            .await
            .values()
            .filter(|t| t.server_id == server_id)
            .cloned()
            .collect()
    }

    pub async fn list_by_category(&self, category: &str) -> Vec<ToolEntry> {
        self.tools
            .read()
            .await
            .values()
            .filter(|t| t.category == category)
            .cloned()
            .collect()
    }

    pub async fn search(&self, query: &str) -> Vec<ToolEntry> {
        let query = query.to_lowercase();
        self.tools
            .read()
            .await
            .values()
            .filter(|t| {
                t.qualified_name.to_lowercase().contains(&query)
                    || t.description.to_lowercase().contains(&query)
                    || t.tags.iter().any(|tag| tag.to_lowercase().contains(&query))
            })
            .cloned()
            .collect()
    }

    pub async fn record_usage(&self, qualified_name: &str) {
        if let Some(entry) = self.tools.write().await.get_mut(qualified_name) {
            entry.record_usage(Utc::now());
        }
    }

    pub async fn count(&self) -> usize {
        self.tools.read().await.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
