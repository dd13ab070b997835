//! MCP server clients
//!
//! Assistants name MCP servers by id; the sandbox bridge lists their tools
//! to build the tool table handed to the sandboxed process.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A tool exposed by an MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    /// Process that backs the tool, if the server maps it to one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
}

/// Client for one MCP server
#[async_trait]
pub trait McpClient: Send + Sync {
    /// List tools, optionally restricted to `filter` names
    async fn list_tools(&self, filter: Option<&[String]>) -> Result<Vec<McpTool>, EngineError>;
}

/// MCP clients by server id
#[derive(Default)]
pub struct McpRegistry {
    clients: RwLock<HashMap<String, Arc<dyn McpClient>>>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, server_id: impl Into<String>, client: Arc<dyn McpClient>) {
        let server_id = server_id.into();
        tracing::debug!("Registered MCP client '{}'", server_id);
        self.clients
            .write()
            .expect("McpRegistry lock poisoned")
            .insert(server_id, client);
    }

    /// Client for `server_id`, if one is registered
    pub fn select(&self, server_id: &str) -> Option<Arc<dyn McpClient>> {
        self.clients
            .read()
            .expect("McpRegistry lock poisoned")
            .get(server_id)
            .cloned()
    }
}
