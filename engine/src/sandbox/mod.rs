//! Sandboxed execution
//!
//! Assistants with a `sandbox` block delegate the completion to an external
//! CLI agent running in an isolated container. A [`SandboxManager`] creates
//! one [`Executor`] per stream call; the executor speaks the same chunk
//! protocol as a direct connector call.
//!
//! The manager is created lazily, once per process, by the factory set on
//! the [`SandboxRegistry`]. Its outcome (manager or error) is memoized.

use crate::context::Context;
use crate::output::ChunkHandler;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use sdk::errors::EngineError;
use sdk::manifest::McpManifest;
use sdk::types::{CompletionResponse, Message};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;

pub mod bridge;
pub mod container;
pub mod options;

pub use bridge::stream_with_sandbox;
pub use container::ContainerManager;
pub use options::{build_options, resolve_secrets};

/// Fallback when neither the assistant nor the runtime sets a timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-assistant sandbox block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// CLI agent to run inside the container
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<f64>,
    /// Duration string such as `90s` or `5m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Extra arguments for the CLI agent
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
    /// Secret name -> value or `$ENV.NAME` reference
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
}

fn default_command() -> String {
    "claude".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            image: None,
            max_memory: None,
            max_cpu: None,
            timeout: None,
            arguments: Map::new(),
            secrets: BTreeMap::new(),
        }
    }
}

/// An MCP tool as seen by the sandboxed process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxTool {
    pub server_id: String,
    /// Tool name on its server
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    /// Process that executes the tool
    pub process: String,
}

/// Everything an executor needs for one stream call
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    pub command: String,
    pub image: String,
    pub max_memory: Option<String>,
    pub max_cpu: Option<f64>,
    pub timeout: Duration,
    pub user_id: String,
    pub chat_id: String,
    pub workdir: String,
    pub skills_dir: Option<PathBuf>,
    pub system_prompt: String,
    pub connector_host: String,
    pub connector_key: String,
    pub model: String,
    /// Connector settings other than the reserved keys
    pub connector_options: Map<String, Value>,
    pub arguments: Map<String, Value>,
    pub secrets: BTreeMap<String, String>,
    pub mcp_config: Option<McpManifest>,
    /// Prefixed tool name (`server__tool`) -> tool
    pub mcp_tools: BTreeMap<String, SandboxTool>,
}

impl std::fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secret_names: Vec<&String> = self.secrets.keys().collect();
        f.debug_struct("ExecutionOptions")
            .field("command", &self.command)
            .field("image", &self.image)
            .field("timeout", &self.timeout)
            .field("user_id", &self.user_id)
            .field("chat_id", &self.chat_id)
            .field("skills_dir", &self.skills_dir)
            .field("connector_host", &self.connector_host)
            .field("connector_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("secrets", &secret_names)
            .field("mcp_tools", &self.mcp_tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// One sandboxed run
#[async_trait]
pub trait Executor: Send + Sync {
    /// Forward the conversation and stream the process output
    async fn stream(
        &self,
        ctx: &Context,
        messages: &[Message],
        handler: ChunkHandler,
    ) -> Result<CompletionResponse, EngineError>;

    /// Id of the "preparing" status message, resolved on first output
    fn set_loading_msg_id(&self, id: &str);

    /// Release the container
    async fn close(&self) -> Result<(), EngineError>;
}

/// Creates executors
#[async_trait]
pub trait SandboxManager: Send + Sync {
    async fn create_executor(
        &self,
        options: ExecutionOptions,
    ) -> Result<Box<dyn Executor>, EngineError>;
}

/// Builds the process-wide manager
pub type ManagerFactory =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn SandboxManager>, EngineError>> + Send + Sync>;

/// Holds the lazily created sandbox manager
#[derive(Default)]
pub struct SandboxRegistry {
    factory: Mutex<Option<ManagerFactory>>,
    manager: OnceCell<Result<Arc<dyn SandboxManager>, String>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how the manager is built; has no effect once it was requested
    pub fn set_factory<F, Fut>(&self, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn SandboxManager>, EngineError>> + Send + 'static,
    {
        let factory: ManagerFactory = Box::new(move || factory().boxed());
        if self.manager.initialized() {
            tracing::warn!("Sandbox manager already initialized, ignoring new factory");
            return;
        }
        *self.factory.lock().expect("SandboxRegistry lock poisoned") = Some(factory);
    }

    /// The manager, created on first call
    ///
    /// Exactly one construction is attempted; concurrent first callers wait
    /// for it and every later caller gets the same manager or error.
    pub async fn get_manager(&self) -> Result<Arc<dyn SandboxManager>, EngineError> {
        let outcome = self
            .manager
            .get_or_init(|| async {
                let pending = self
                    .factory
                    .lock()
                    .expect("SandboxRegistry lock poisoned")
                    .as_ref()
                    .map(|factory| factory());

                match pending {
                    None => Err("no sandbox manager configured".to_string()),
                    Some(pending) => match pending.await {
                        Ok(manager) => {
                            tracing::info!("Sandbox manager initialized");
                            Ok(manager)
                        }
                        Err(e) => {
                            tracing::error!("Sandbox manager initialization failed: {}", e);
                            Err(e.to_string())
                        }
                    },
                }
            })
            .await;

        outcome
            .clone()
            .map_err(|e| EngineError::NotConfigured(format!("sandbox manager unavailable: {}", e)))
    }
}
