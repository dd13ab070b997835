use super::{Request, ResultItem, SearchHandler, SearchType, WebSearchConfig};
use crate::config::resolve_env_ref;
use async_trait::async_trait;
use sdk::errors::EngineError;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://serpapi.com";

/// Web search through a SerpAPI-compatible endpoint
pub struct SerpApiSearch {
    base_url: String,
    api_key: String,
    engine: String,
    client: reqwest::Client,
}

impl SerpApiSearch {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            engine: "google".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from `[search.web]`; `None` when no API key is available
    pub fn from_config(config: &WebSearchConfig) -> Option<Self> {
        let provider = config.provider.as_deref().unwrap_or("serpapi");
        if provider != "serpapi" {
            tracing::warn!("Unsupported web search provider '{}'", provider);
            return None;
        }

        let raw = config.api_key.as_deref()?;
        let api_key = if raw.starts_with("$ENV.") {
            resolve_env_ref(raw)?
        } else {
            raw.to_string()
        };
        if api_key.is_empty() {
            return None;
        }

        let base_url = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        Some(Self::new(base_url, api_key))
    }
}

#[async_trait]
impl SearchHandler for SerpApiSearch {
    async fn search(&self, request: &Request) -> Result<Vec<ResultItem>, EngineError> {
        let url = format!("{}/search.json", self.base_url);
        let num = request.limit.max(1).to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("engine", self.engine.as_str()),
                ("q", request.query.as_str()),
                ("num", num.as_str()),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| EngineError::Execution(format!("web search request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(EngineError::Execution(format!(
                "web search returned HTTP {}",
                status.as_u16()
            )));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| EngineError::Parse(format!("web search response: {}", e)))?;

        if let Some(error) = data.get("error").and_then(Value::as_str) {
            return Err(EngineError::Execution(format!("web search: {}", error)));
        }

        let organic = data
            .get("organic_results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let items = organic
            .iter()
            .take(request.limit.max(1))
            .enumerate()
            .map(|(i, entry)| {
                let title = entry.get("title").and_then(Value::as_str).unwrap_or("");
                let snippet = entry.get("snippet").and_then(Value::as_str).unwrap_or("");
                let position = entry
                    .get("position")
                    .and_then(Value::as_u64)
                    .unwrap_or(i as u64 + 1);

                let mut item = ResultItem::new(SearchType::Web, title, snippet);
                if let Some(link) = entry.get("link").and_then(Value::as_str) {
                    item = item.with_url(link);
                }
                item.score = 1.0 / position.max(1) as f64;
                item.metadata
                    .insert("position".to_string(), json!(position));
                item
            })
            .collect();

        Ok(items)
    }
}
