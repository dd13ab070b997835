//! Search
//!
//! Retrieval-augmented context for assistant turns. The orchestrator decides
//! whether a turn needs a search, builds web / knowledge-base / database
//! requests, dispatches them in parallel through the [`Searcher`], and turns
//! the merged results into a citation-annotated reference block that is
//! injected into the conversation.
//!
//! Search never blocks a turn: intent-check failures default to searching,
//! and dispatch failures degrade to answering without references.

use async_trait::async_trait;
use futures::future::join_all;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use std::time::Instant;

pub mod keyword;
pub mod orchestrator;
pub mod reference;
pub mod web;

pub use orchestrator::{
    execute_auto_search, inject_search_context, search_enabled, should_auto_search,
};
pub use reference::{
    build_reference_context, build_references, citation_prompt, format_references_xml,
    DEFAULT_CITATION_PROMPT,
};
pub use web::SerpApiSearch;

/// Search backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Web,
    Kb,
    Db,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Web => "web",
            SearchType::Kb => "kb",
            SearchType::Db => "db",
        }
    }
}

/// Who asked for a search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    User,
    Hook,
    #[default]
    Auto,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::User => "user",
            SourceType::Hook => "hook",
            SourceType::Auto => "auto",
        }
    }
}

/// One search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: SearchType,
    pub query: String,
    #[serde(default)]
    pub source: SourceType,
    pub limit: usize,
    /// Knowledge-base collections
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<String>,
    /// Knowledge-base similarity threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Include knowledge-graph results
    #[serde(default)]
    pub graph: bool,
    /// Database models to query
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl Request {
    pub fn new(kind: SearchType, query: impl Into<String>, limit: usize) -> Self {
        Self {
            kind,
            query: query.into(),
            source: SourceType::Auto,
            limit,
            collections: Vec::new(),
            threshold: None,
            graph: false,
            models: Vec::new(),
            keywords: Vec::new(),
        }
    }
}

/// One result item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    /// Citation id assigned after the merge; unique across one search
    #[serde(default)]
    pub citation_id: String,
    #[serde(rename = "type")]
    pub kind: SearchType,
    #[serde(default)]
    pub source: SourceType,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ResultItem {
    pub fn new(kind: SearchType, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            citation_id: String::new(),
            kind,
            source: SourceType::Auto,
            weight: 0.0,
            score: 0.0,
            title: title.into(),
            content: content.into(),
            url: None,
            metadata: Map::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Results of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    #[serde(rename = "type")]
    pub kind: SearchType,
    pub query: String,
    pub source: SourceType,
    pub items: Vec<ResultItem>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A citable reference derived from a result item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SearchType,
    pub source: SourceType,
    pub weight: f64,
    pub score: f64,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// References ready to inject into a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReferenceContext {
    pub references: Vec<Reference>,
    pub xml: String,
    pub prompt: String,
}

/// Web search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WebSearchConfig {
    /// Provider name (`serpapi`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// API key, or `$ENV.NAME`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

/// Knowledge-base search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KbSearchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub graph: bool,
}

/// Database search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DbSearchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
}

/// Citation formatting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CitationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Replaces the default citation instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_prompt: Option<String>,
}

/// Relevance weight per search source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceWeights {
    #[serde(default = "default_user_weight")]
    pub user: f64,
    #[serde(default = "default_hook_weight")]
    pub hook: f64,
    #[serde(default = "default_auto_weight")]
    pub auto: f64,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            user: default_user_weight(),
            hook: default_hook_weight(),
            auto: default_auto_weight(),
        }
    }
}

impl SourceWeights {
    pub fn for_source(&self, source: SourceType) -> f64 {
        match source {
            SourceType::User => self.user,
            SourceType::Hook => self.hook,
            SourceType::Auto => self.auto,
        }
    }
}

fn default_user_weight() -> f64 {
    1.0
}

fn default_hook_weight() -> f64 {
    0.8
}

fn default_auto_weight() -> f64 {
    0.6
}

/// Search configuration, global or per assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SearchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebSearchConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kb: Option<KbSearchConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<DbSearchConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<CitationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<SourceWeights>,
}

impl SearchConfig {
    /// Whether any block is set
    pub fn is_empty(&self) -> bool {
        self.web.is_none()
            && self.kb.is_none()
            && self.db.is_none()
            && self.citation.is_none()
            && self.weights.is_none()
    }

    /// Overlay `self` on top of `base`; blocks set in `self` win
    pub fn merged_over(&self, base: &SearchConfig) -> SearchConfig {
        SearchConfig {
            web: self.web.clone().or_else(|| base.web.clone()),
            kb: self.kb.clone().or_else(|| base.kb.clone()),
            db: self.db.clone().or_else(|| base.db.clone()),
            citation: self.citation.clone().or_else(|| base.citation.clone()),
            weights: self.weights.or(base.weights),
        }
    }

    pub fn weights(&self) -> SourceWeights {
        self.weights.unwrap_or_default()
    }
}

/// A search backend
#[async_trait]
pub trait SearchHandler: Send + Sync {
    async fn search(&self, request: &Request) -> Result<Vec<ResultItem>, EngineError>;
}

/// Dispatches requests to the registered backends
#[derive(Default)]
pub struct Searcher {
    web: RwLock<Option<Arc<dyn SearchHandler>>>,
    kb: RwLock<Option<Arc<dyn SearchHandler>>>,
    db: RwLock<Option<Arc<dyn SearchHandler>>>,
}

impl Searcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: SearchType) -> &RwLock<Option<Arc<dyn SearchHandler>>> {
        match kind {
            SearchType::Web => &self.web,
            SearchType::Kb => &self.kb,
            SearchType::Db => &self.db,
        }
    }

    /// Install the backend for `kind`
    pub fn set_handler(&self, kind: SearchType, handler: Arc<dyn SearchHandler>) {
        *self.slot(kind).write().expect("Searcher lock poisoned") = Some(handler);
    }

    pub fn handler(&self, kind: SearchType) -> Option<Arc<dyn SearchHandler>> {
        self.slot(kind)
            .read()
            .expect("Searcher lock poisoned")
            .clone()
    }

    /// Run every request concurrently
    ///
    /// Results come back in request order. A failing backend yields a result
    /// with `error` set and no items; the call as a whole only fails when
    /// every request failed. Citation ids are assigned sequentially across
    /// all items, starting at 1.
    pub async fn all(
        &self,
        requests: &[Request],
        weights: &SourceWeights,
    ) -> Result<Vec<SearchResult>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let futures = requests.iter().map(|request| async move {
            let start = Instant::now();
            let outcome = match self.handler(request.kind) {
                Some(handler) => handler.search(request).await,
                None => Err(EngineError::NotConfigured(format!(
                    "no {} search handler",
                    request.kind.as_str()
                ))),
            };
            let duration_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(mut items) => {
                    items.truncate(request.limit.max(1));
                    SearchResult {
                        kind: request.kind,
                        query: request.query.clone(),
                        source: request.source,
                        items,
                        duration_ms,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!("{} search failed: {}", request.kind.as_str(), e);
                    SearchResult {
                        kind: request.kind,
                        query: request.query.clone(),
                        source: request.source,
                        items: Vec::new(),
                        duration_ms,
                        error: Some(e.to_string()),
                    }
                }
            }
        });

        let mut results = join_all(futures).await;

        if results.iter().all(|r| r.error.is_some()) {
            let errors: Vec<String> = results
                .iter()
                .filter_map(|r| r.error.as_deref())
                .map(String::from)
                .collect();
            return Err(EngineError::Execution(format!(
                "all search requests failed: {}",
                errors.join("; ")
            )));
        }

        let mut next_id = 1usize;
        for result in &mut results {
            let weight = weights.for_source(result.source);
            for item in &mut result.items {
                item.citation_id = next_id.to_string();
                item.source = result.source;
                item.weight = weight;
                next_id += 1;
            }
        }

        Ok(results)
    }
}
