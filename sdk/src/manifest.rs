//! MCP manifest handed to sandboxed agents
//!
//! The sandbox process reaches tools through a single bridge server that
//! talks to the host over an IPC socket. The manifest written into the
//! container has the shape:
//!
//! ```json
//! {"mcpServers": {"yao": {"command": "yao-bridge", "args": ["/tmp/yao.sock"]}}}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Server key the bridge registers under
pub const BRIDGE_SERVER_NAME: &str = "yao";

/// Executable that proxies MCP traffic to the host socket
pub const BRIDGE_COMMAND: &str = "yao-bridge";

/// One MCP server launch entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Top-level MCP manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct McpManifest {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: BTreeMap<String, McpServerEntry>,
}

impl McpManifest {
    /// Manifest that routes every tool call through the bridge at `socket`
    pub fn bridge(socket: impl Into<String>) -> Self {
        let mut mcp_servers = BTreeMap::new();
        mcp_servers.insert(
            BRIDGE_SERVER_NAME.to_string(),
            McpServerEntry {
                command: BRIDGE_COMMAND.to_string(),
                args: vec![socket.into()],
            },
        );
        Self { mcp_servers }
    }

    /// Serialize to the JSON bytes written into the sandbox
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
