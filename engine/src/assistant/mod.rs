//! Assistants
//!
//! An [`Assistant`] is a loaded definition plus the live resources bound to
//! it at initialization: compiled hook scripts and a connector client. Live
//! assistants are held by the runtime cache; evicting one unregisters the
//! script handlers it registered.

use crate::cache::Cached;
use crate::connector::Connector;
use crate::runtime::Runtime;
use crate::sandbox::SandboxConfig;
use crate::script::{HandlerRegistry, HookScript};
use crate::search::{ReferenceContext, SearchConfig};
use crate::store::AssistantRecord;
use sdk::errors::EngineError;
use sdk::types::{CompletionResponse, Message, Uses};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod loader;
pub mod normalize;
pub mod stream;

/// Models known to accept image input
pub const VISION_CAPABLE_MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4-turbo",
    "gpt-4-vision-preview",
    "gpt-4.1",
    "gpt-4.1-mini",
    "claude-3-5-sonnet",
    "claude-3-7-sonnet",
    "claude-sonnet-4",
    "gemini-1.5-pro",
    "gemini-2.0-flash",
    "qwen-vl-max",
];

fn default_prompt_role() -> String {
    "system".to_string()
}

/// A prompt template entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    #[serde(default = "default_prompt_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Prompt {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: default_prompt_role(),
            content: content.into(),
            name: None,
        }
    }

    /// As a conversation message; unknown roles become `system`
    pub fn to_message(&self) -> Message {
        let role = serde_json::from_value(Value::String(self.role.clone()))
            .unwrap_or(sdk::types::Role::System);
        let mut message = Message::new(role, self.content.clone());
        message.name = self.name.clone();
        message
    }
}

/// Empty-chat hints shown by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Placeholder {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<String>,
}

/// A function tool offered to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// Tools plus the prompts that explain them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolCalls {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub prompts: Vec<Prompt>,
}

/// An MCP server bound to an assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct McpServerRef {
    pub server_id: String,
    /// Tool allow-list (empty means every tool)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct McpServers {
    #[serde(default)]
    pub servers: Vec<McpServerRef>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

/// Knowledge-base collections searched by the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KnowledgeBase {
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

/// Database models searched by the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DatabaseRef {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

/// Locale code -> message table
pub type Locales = BTreeMap<String, Map<String, Value>>;

/// The declarative part of an assistant
///
/// Serializes to the record shape accepted by `Runtime::load_from_map`.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct AssistantDefinition {
    #[serde(rename = "assistant_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub connector: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub connector_options: Map<String, Value>,
    /// Package path under the app root (`/assistants/...`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub options: Map<String, Value>,
    pub prompts: Vec<Prompt>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<Placeholder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolCalls>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpServers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kb: Option<KnowledgeBase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<DatabaseRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uses: Option<Uses>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub locales: Locales,
    pub readonly: bool,
    pub public: bool,
    pub built_in: bool,
    pub mentionable: bool,
    pub automated: bool,
    pub sort: i64,
    /// Nanoseconds since the Unix epoch
    pub created_at: i64,
    /// Nanoseconds since the Unix epoch
    pub updated_at: i64,
    /// Hook script source in text form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// A live assistant
#[derive(Clone)]
pub struct Assistant {
    pub definition: AssistantDefinition,
    /// Hook script (`Create`, `Next`)
    pub script: Option<Arc<dyn HookScript>>,
    /// Secondary scripts registered as handlers, by script id
    pub scripts: BTreeMap<String, Arc<dyn HookScript>>,
    pub connector: Option<Arc<dyn Connector>>,
    pub vision: bool,
    /// Whether the hook script exports `Init`
    pub init_hook: bool,
    handlers: Option<Arc<HandlerRegistry>>,
    handler_owner: u64,
}

impl std::fmt::Debug for Assistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assistant")
            .field("id", &self.definition.id)
            .field("name", &self.definition.name)
            .field("connector", &self.definition.connector)
            .field("script", &self.script.as_ref().map(|s| s.id().to_string()))
            .field("scripts", &self.scripts.keys().collect::<Vec<_>>())
            .field("vision", &self.vision)
            .finish_non_exhaustive()
    }
}

impl Cached for Assistant {
    fn cache_key(&self) -> &str {
        &self.definition.id
    }

    fn release(&self) {
        if let Some(handlers) = &self.handlers {
            handlers.unregister_assistant(&self.definition.id, self.handler_owner);
        }
    }
}

impl Assistant {
    /// Wrap a definition with no live resources bound yet
    pub fn new(definition: AssistantDefinition) -> Self {
        Self {
            definition,
            script: None,
            scripts: BTreeMap::new(),
            connector: None,
            vision: false,
            init_hook: false,
            handlers: None,
            handler_owner: 0,
        }
    }

    pub(crate) fn with_handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handler_owner = handlers.owner_token();
        self.handlers = Some(handlers);
        self
    }

    /// Token under which this instance registers its script handlers
    pub(crate) fn handler_owner(&self) -> u64 {
        self.handler_owner
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Check the required fields
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.definition.id.is_empty() {
            return Err(EngineError::Validation("assistant_id is required".to_string()));
        }
        if self.definition.name.is_empty() {
            return Err(EngineError::Validation("name is required".to_string()));
        }
        Ok(())
    }

    /// Apply a partial record
    ///
    /// Identity fields (`assistant_id`, `path`, `built_in`) cannot be
    /// changed. Fields are decoded with the same rules as a full load.
    pub fn update(&mut self, data: &Map<String, Value>) -> Result<(), EngineError> {
        for key in ["assistant_id", "id", "path", "built_in"] {
            if let Some(value) = data.get(key) {
                let current = self.to_map().get(key).cloned().unwrap_or(Value::Null);
                if key == "id" || *value != current {
                    return Err(EngineError::Validation(format!("{} cannot be updated", key)));
                }
            }
        }

        let mut merged = self.to_map();
        for (key, value) in data {
            merged.insert(key.clone(), value.clone());
        }

        let mut updated = normalize::definition_from_map(&merged)?;
        updated.updated_at = now_nanos();

        self.definition = updated;
        self.validate()
    }

    /// Record form of the definition
    pub fn to_map(&self) -> AssistantRecord {
        match serde_json::to_value(&self.definition) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Persist the definition to the runtime store
    pub async fn save(&self, rt: &Runtime) -> Result<String, EngineError> {
        self.validate()?;
        let store = rt.store().ok_or_else(|| {
            EngineError::NotConfigured("no assistant store configured".to_string())
        })?;
        store.save_assistant(&self.to_map()).await
    }

    /// Prompts as system messages
    pub fn prompt_messages(&self) -> Vec<Message> {
        self.definition
            .prompts
            .iter()
            .map(Prompt::to_message)
            .collect()
    }
}

pub(crate) fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Value returned by the `Create` hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HookCreateResponse {
    /// Replacement input messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<Uses>,
    /// Connector override for this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,
    /// Extra model options for this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
}

/// Outcome of one stream call
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Response {
    pub assistant_id: String,
    pub chat_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionResponse>,
    /// Value returned by the `Next` hook
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Value>,
    /// References injected by the automatic search
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<ReferenceContext>,
}
