//! Connector abstraction
//!
//! A connector is a named model endpoint. Assistants reference connectors by
//! id; the [`ConnectorRegistry`] resolves ids to live clients.

use crate::config::{resolve_env_ref, ConnectorConfig};
use crate::output::ChunkHandler;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{CompletionResponse, Message};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

pub mod openai;

pub use openai::OpenAIConnector;

/// Errors raised by connector transports
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<ConnectorError> for EngineError {
    fn from(err: ConnectorError) -> Self {
        EngineError::Execution(err.to_string())
    }
}

/// A model endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector id as referenced by assistants
    fn id(&self) -> &str;

    /// Model served by this connector
    fn model(&self) -> &str;

    /// Connection settings: `host`, `key`, `model` plus extra options
    fn setting(&self) -> Map<String, Value>;

    /// Whether the connector speaks the given protocol family
    fn is(&self, kind: &str) -> bool;

    /// Run a completion, reporting each chunk to `handler`
    async fn stream(
        &self,
        messages: &[Message],
        options: &Map<String, Value>,
        handler: ChunkHandler,
    ) -> Result<CompletionResponse, ConnectorError>;
}

/// Connectors by id
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from `[connectors.*]`
    pub fn from_config(configs: &BTreeMap<String, ConnectorConfig>) -> Self {
        let registry = Self::new();
        for (id, config) in configs {
            let api_key = config
                .api_key
                .as_deref()
                .map(|key| resolve_env_ref(key).unwrap_or_else(|| key.to_string()));
            registry.register(Arc::new(OpenAIConnector::new(
                id.clone(),
                config.base_url.clone(),
                config.model.clone(),
                api_key,
                config.options.clone(),
            )));
        }
        registry
    }

    pub fn register(&self, connector: Arc<dyn Connector>) {
        tracing::debug!("Registered connector '{}'", connector.id());
        self.connectors
            .write()
            .expect("ConnectorRegistry lock poisoned")
            .insert(connector.id().to_string(), connector);
    }

    /// Resolve a connector id
    pub fn get(&self, id: &str) -> Result<Arc<dyn Connector>, EngineError> {
        self.connectors
            .read()
            .expect("ConnectorRegistry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("connector '{}'", id)))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connectors
            .read()
            .expect("ConnectorRegistry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
