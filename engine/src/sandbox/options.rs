use super::{ExecutionOptions, SandboxTool, DEFAULT_TIMEOUT};
use crate::assistant::{Assistant, McpServers};
use crate::config::{parse_duration, resolve_env_ref};
use crate::context::Context;
use crate::mcp::McpRegistry;
use crate::runtime::Runtime;
use sdk::errors::EngineError;
use sdk::manifest::McpManifest;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Connector settings that are mapped explicitly and never passed through
const RESERVED_CONNECTOR_KEYS: &[&str] = &["host", "key", "model", "type", "proxy"];

const ANONYMOUS_USER: &str = "anonymous";

/// Build the execution options for one sandboxed stream call
pub async fn build_options(
    rt: &Runtime,
    assistant: &Assistant,
    ctx: &Context,
) -> Result<ExecutionOptions, EngineError> {
    let config = assistant.definition.sandbox.clone().ok_or_else(|| {
        EngineError::Config(format!("assistant '{}' has no sandbox block", assistant.id()))
    })?;
    let settings = rt.sandbox_settings();

    let timeout_text = config.timeout.as_deref().unwrap_or(&settings.timeout);
    let timeout = parse_duration(timeout_text)
        .map_err(|e| EngineError::Config(format!("sandbox timeout '{}': {}", timeout_text, e)))?;
    let timeout = if timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        timeout
    };

    if ctx.chat_id.is_empty() {
        return Err(EngineError::Config(
            "sandbox execution requires a chat id".to_string(),
        ));
    }

    let mut options = ExecutionOptions {
        command: config.command.clone(),
        image: config.image.clone().unwrap_or_else(|| settings.image.clone()),
        max_memory: config.max_memory.clone().or_else(|| settings.max_memory.clone()),
        max_cpu: config.max_cpu.or(settings.max_cpu),
        timeout,
        user_id: ctx.user_id().unwrap_or(ANONYMOUS_USER).to_string(),
        chat_id: ctx.chat_id.clone(),
        workdir: settings.container_workdir.clone(),
        skills_dir: skills_dir(rt, assistant),
        system_prompt: system_prompt(assistant),
        arguments: config.arguments.clone(),
        secrets: resolve_secrets(&config.secrets),
        ..Default::default()
    };

    if let Some(connector) = &assistant.connector {
        let setting = connector.setting();
        let text = |key: &str| {
            setting
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        options.connector_host = text("host");
        options.connector_key = text("key");
        options.model = text("model");
        options.connector_options = passthrough_options(&setting);
    }

    if let Some(servers) = assistant.definition.mcp.as_ref().filter(|m| !m.servers.is_empty()) {
        options.mcp_tools = build_tool_table(rt.mcp(), servers).await;
        options.mcp_config = Some(McpManifest::bridge(&settings.ipc_socket));
    }

    tracing::debug!("Sandbox options for '{}': {:?}", assistant.id(), options);
    Ok(options)
}

/// Resolve secret values; `$ENV.NAME` references that are unset or empty are dropped
pub fn resolve_secrets(secrets: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    secrets
        .iter()
        .filter_map(|(name, value)| {
            let resolved = if value.starts_with("$ENV.") {
                resolve_env_ref(value)?
            } else {
                value.clone()
            };
            if resolved.is_empty() {
                tracing::debug!("Sandbox secret '{}' resolved empty, omitted", name);
                return None;
            }
            Some((name.clone(), resolved))
        })
        .collect()
}

fn passthrough_options(setting: &Map<String, Value>) -> Map<String, Value> {
    setting
        .iter()
        .filter(|(key, _)| !RESERVED_CONNECTOR_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn system_prompt(assistant: &Assistant) -> String {
    assistant
        .definition
        .prompts
        .iter()
        .find(|p| p.role == "system")
        .map(|p| p.content.clone())
        .unwrap_or_default()
}

/// `<app_root>/<assistant path>/skills`, when it exists
fn skills_dir(rt: &Runtime, assistant: &Assistant) -> Option<PathBuf> {
    let path = assistant.definition.path.as_deref()?;
    let dir = rt
        .app_root()
        .join(path.trim_start_matches('/'))
        .join("skills");
    dir.is_dir().then_some(dir)
}

/// List tools from every configured server into `server__tool` entries
///
/// Unknown servers, listing failures and tools without a backing process
/// are skipped with a warning.
pub async fn build_tool_table(
    registry: &McpRegistry,
    servers: &McpServers,
) -> BTreeMap<String, SandboxTool> {
    let mut table = BTreeMap::new();

    for server in &servers.servers {
        let Some(client) = registry.select(&server.server_id) else {
            tracing::warn!("MCP server '{}' not found, skipped", server.server_id);
            continue;
        };

        let filter = (!server.tools.is_empty()).then_some(server.tools.as_slice());
        let tools = match client.list_tools(filter).await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!("Failed to list tools of '{}': {}", server.server_id, e);
                continue;
            }
        };

        for tool in tools {
            if let Some(allowed) = filter {
                if !allowed.contains(&tool.name) {
                    continue;
                }
            }
            let Some(process) = tool.process.clone().filter(|p| !p.is_empty()) else {
                tracing::warn!(
                    "MCP tool '{}' of '{}' has no backing process, skipped",
                    tool.name,
                    server.server_id
                );
                continue;
            };

            let key = format!("{}__{}", server.server_id, tool.name);
            table.insert(
                key,
                SandboxTool {
                    server_id: server.server_id.clone(),
                    name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                    process,
                },
            );
        }
    }

    table
}
