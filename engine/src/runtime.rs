//! Assistant runtime
//!
//! [`Runtime`] holds the process-wide services assistants depend on: the
//! live-assistant cache, the record store, connectors, the script engine,
//! search backends, MCP clients and the sandbox manager. It is cheap to
//! clone; every clone shares the same services.
//!
//! Setters are meant for startup. Readers take short locks and never hold
//! them across an await.

use crate::assistant::Assistant;
use crate::cache::Cache;
use crate::config::{expand_path, Config, SandboxSettings};
use crate::connector::ConnectorRegistry;
use crate::db::Database;
use crate::mcp::McpRegistry;
use crate::sandbox::{ContainerManager, SandboxManager, SandboxRegistry};
use crate::script::{HandlerRegistry, ScriptEngine, WasmScriptEngine};
use crate::search::{SearchConfig, SearchType, SerpApiSearch, Searcher};
use crate::store::AssistantStore;
use sdk::errors::EngineError;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Static settings of a runtime
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Root of the application tree holding `assistants/`
    pub app_root: PathBuf,
    pub cache_capacity: usize,
    pub default_connector: Option<String>,
    /// Assistant deciding whether a turn needs a search
    pub needsearch_agent: String,
    /// Assistant extracting search keywords
    pub keyword_agent: String,
    pub sandbox: SandboxSettings,
    /// Global search defaults
    pub search: SearchConfig,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from(&Config::default_config())
    }
}

impl From<&Config> for RuntimeSettings {
    fn from(config: &Config) -> Self {
        Self {
            app_root: config.core.app_root.clone(),
            cache_capacity: config.assistants.cache_capacity,
            default_connector: config.assistants.default_connector.clone(),
            needsearch_agent: config.assistants.needsearch_agent.clone(),
            keyword_agent: config.assistants.keyword_agent.clone(),
            sandbox: config.sandbox.clone(),
            search: config.search.clone(),
        }
    }
}

struct Inner {
    settings: RuntimeSettings,
    cache: Cache<Assistant>,
    store: RwLock<Option<Arc<dyn AssistantStore>>>,
    default_connector: RwLock<Option<String>>,
    connectors: ConnectorRegistry,
    script_engine: RwLock<Arc<dyn ScriptEngine>>,
    handlers: Arc<HandlerRegistry>,
    searcher: Searcher,
    mcp: McpRegistry,
    sandbox: SandboxRegistry,
}

/// Shared services of the assistant engine
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("app_root", &self.inner.settings.app_root)
            .field("cached", &self.inner.cache.len())
            .field("connectors", &self.inner.connectors.ids())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// A runtime with no store, no connectors and no search backends
    pub fn new(settings: RuntimeSettings) -> Self {
        Self::with_connectors(settings, ConnectorRegistry::new())
    }

    pub fn with_connectors(settings: RuntimeSettings, connectors: ConnectorRegistry) -> Self {
        let default_connector = settings.default_connector.clone();
        Self {
            inner: Arc::new(Inner {
                cache: Cache::new(settings.cache_capacity),
                store: RwLock::new(None),
                default_connector: RwLock::new(default_connector),
                connectors,
                script_engine: RwLock::new(Arc::new(WasmScriptEngine::new())),
                handlers: Arc::new(HandlerRegistry::new()),
                searcher: Searcher::new(),
                mcp: McpRegistry::new(),
                sandbox: SandboxRegistry::new(),
                settings,
            }),
        }
    }

    /// Wire a runtime from configuration
    ///
    /// Registers the configured connectors, the SerpAPI backend when web
    /// search has a key, and the container sandbox when it is enabled. The
    /// sandbox runtime is only contacted on first use.
    pub fn from_config(config: &Config) -> Self {
        let rt = Self::with_connectors(
            RuntimeSettings::from(config),
            ConnectorRegistry::from_config(&config.connectors),
        );

        if let Some(web) = &config.search.web {
            match SerpApiSearch::from_config(web) {
                Some(search) => rt.searcher().set_handler(SearchType::Web, Arc::new(search)),
                None => tracing::warn!("Web search configured without an API key"),
            }
        }

        if config.sandbox.enabled {
            let settings = config.sandbox.clone();
            rt.sandbox().set_factory(move || {
                let settings = settings.clone();
                async move {
                    let manager = ContainerManager::connect(settings).await?;
                    Ok(Arc::new(manager) as Arc<dyn SandboxManager>)
                }
            });
        }

        rt
    }

    /// Open the SQLite database at `path` and use it as the store
    pub async fn attach_sqlite(&self, path: &Path) -> Result<Database, EngineError> {
        let path = expand_path(path)?;
        let db = Database::new(&path)
            .await
            .map_err(|e| EngineError::Database(format!("{:#}", e)))?;
        self.set_store(Arc::new(db.store()));
        Ok(db)
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    pub fn app_root(&self) -> &Path {
        &self.inner.settings.app_root
    }

    pub fn cache(&self) -> &Cache<Assistant> {
        &self.inner.cache
    }

    pub fn store(&self) -> Option<Arc<dyn AssistantStore>> {
        self.inner
            .store
            .read()
            .expect("Runtime store lock poisoned")
            .clone()
    }

    pub fn set_store(&self, store: Arc<dyn AssistantStore>) {
        *self.inner.store.write().expect("Runtime store lock poisoned") = Some(store);
    }

    pub fn default_connector(&self) -> Option<String> {
        self.inner
            .default_connector
            .read()
            .expect("Runtime connector lock poisoned")
            .clone()
    }

    pub fn set_default_connector(&self, connector: Option<String>) {
        *self
            .inner
            .default_connector
            .write()
            .expect("Runtime connector lock poisoned") = connector;
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.inner.connectors
    }

    pub fn script_engine(&self) -> Arc<dyn ScriptEngine> {
        let engine = self
            .inner
            .script_engine
            .read()
            .expect("Runtime script engine lock poisoned");
        Arc::clone(&*engine)
    }

    pub fn set_script_engine(&self, engine: Arc<dyn ScriptEngine>) {
        *self
            .inner
            .script_engine
            .write()
            .expect("Runtime script engine lock poisoned") = engine;
    }

    /// Named script handlers registered by loaded assistants
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.handlers
    }

    pub fn searcher(&self) -> &Searcher {
        &self.inner.searcher
    }

    pub fn search_config(&self) -> SearchConfig {
        self.inner.settings.search.clone()
    }

    pub fn mcp(&self) -> &McpRegistry {
        &self.inner.mcp
    }

    pub fn sandbox(&self) -> &SandboxRegistry {
        &self.inner.sandbox
    }

    pub fn sandbox_settings(&self) -> &SandboxSettings {
        &self.inner.settings.sandbox
    }

    pub fn needsearch_agent(&self) -> &str {
        &self.inner.settings.needsearch_agent
    }

    pub fn keyword_agent(&self) -> &str {
        &self.inner.settings.keyword_agent
    }

    /// Resolve a live assistant by id
    pub async fn get(&self, id: &str) -> Result<Arc<Assistant>, EngineError> {
        self.load_from_store(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default_config();
        config.assistants.cache_capacity = 7;
        config.assistants.default_connector = Some("gpt".to_string());

        let settings = RuntimeSettings::from(&config);
        assert_eq!(settings.cache_capacity, 7);
        assert_eq!(settings.needsearch_agent, "__system.needsearch");

        let rt = Runtime::new(settings);
        assert_eq!(rt.cache().capacity(), 7);
        assert_eq!(rt.default_connector().as_deref(), Some("gpt"));
    }

    #[test]
    fn test_clones_share_services() {
        let rt = Runtime::new(RuntimeSettings::default());
        let other = rt.clone();

        assert!(other.store().is_none());
        rt.set_store(Arc::new(MemoryStore::new()));
        assert!(other.store().is_some());

        rt.set_default_connector(None);
        assert!(other.default_connector().is_none());
    }

    #[tokio::test]
    async fn test_get_without_store_is_not_configured() {
        let rt = Runtime::new(RuntimeSettings::default());
        let err = rt.get("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotConfigured(_)));
    }
}
