//! Assistant persistence
//!
//! Assistants are stored as key-value records (the same shape accepted by
//! `Runtime::load_from_map`). Search executions are stored as
//! [`SearchRecord`]s whether they succeeded or not.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// A stored assistant
pub type AssistantRecord = Map<String, Value>;

/// Selects assistants in bulk queries
#[derive(Debug, Clone, Default)]
pub struct AssistantFilter {
    pub built_in: Option<bool>,
    /// Only these ids (empty means any)
    pub assistant_ids: Vec<String>,
    /// Never these ids
    pub exclude_ids: Vec<String>,
    /// Require at least one of these tags (empty means any)
    pub tags: Vec<String>,
}

impl AssistantFilter {
    /// Whether `record` passes the filter
    pub fn matches(&self, record: &AssistantRecord) -> bool {
        let id = record
            .get("assistant_id")
            .or_else(|| record.get("id"))
            .and_then(Value::as_str)
            .unwrap_or("");

        if let Some(built_in) = self.built_in {
            let flag = record
                .get("built_in")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if flag != built_in {
                return false;
            }
        }
        if !self.assistant_ids.is_empty() && !self.assistant_ids.iter().any(|a| a == id) {
            return false;
        }
        if self.exclude_ids.iter().any(|a| a == id) {
            return false;
        }
        if !self.tags.is_empty() {
            let tags: Vec<&str> = record
                .get("tags")
                .and_then(Value::as_array)
                .map(|t| t.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if !self.tags.iter().any(|t| tags.contains(&t.as_str())) {
                return false;
            }
        }
        true
    }
}

/// One reference in a persisted search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchReferenceRecord {
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub snippet: String,
    pub content: String,
    pub metadata: Value,
}

/// A persisted search execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub request_id: String,
    pub chat_id: String,
    pub assistant_id: String,
    pub query: String,
    pub keywords: Vec<String>,
    pub config: Value,
    pub source: String,
    pub references: Vec<SearchReferenceRecord>,
    pub xml: String,
    pub prompt: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

/// Assistant and search persistence
#[async_trait]
pub trait AssistantStore: Send + Sync {
    /// Fetch one assistant; `NotFound` if absent
    async fn get_assistant(&self, assistant_id: &str) -> Result<AssistantRecord, EngineError>;

    /// Insert or replace an assistant; returns its id
    async fn save_assistant(&self, record: &AssistantRecord) -> Result<String, EngineError>;

    /// Delete matching assistants; returns how many were removed
    async fn delete_assistants(&self, filter: &AssistantFilter) -> Result<u64, EngineError>;

    async fn get_assistants(
        &self,
        filter: &AssistantFilter,
    ) -> Result<Vec<AssistantRecord>, EngineError>;

    async fn save_search(&self, record: &SearchRecord) -> Result<(), EngineError>;
}

pub(crate) fn record_id(record: &AssistantRecord) -> Result<String, EngineError> {
    record
        .get("assistant_id")
        .or_else(|| record.get("id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .ok_or_else(|| EngineError::Validation("assistant record has no id".to_string()))
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    assistants: RwLock<BTreeMap<String, AssistantRecord>>,
    searches: RwLock<Vec<SearchRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every search saved so far
    pub fn searches(&self) -> Vec<SearchRecord> {
        self.searches
            .read()
            .expect("MemoryStore lock poisoned")
            .clone()
    }
}

#[async_trait]
impl AssistantStore for MemoryStore {
    async fn get_assistant(&self, assistant_id: &str) -> Result<AssistantRecord, EngineError> {
        self.assistants
            .read()
            .expect("MemoryStore lock poisoned")
            .get(assistant_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("assistant '{}'", assistant_id)))
    }

    async fn save_assistant(&self, record: &AssistantRecord) -> Result<String, EngineError> {
        let id = record_id(record)?;
        self.assistants
            .write()
            .expect("MemoryStore lock poisoned")
            .insert(id.clone(), record.clone());
        Ok(id)
    }

    async fn delete_assistants(&self, filter: &AssistantFilter) -> Result<u64, EngineError> {
        let mut assistants = self.assistants.write().expect("MemoryStore lock poisoned");
        let before = assistants.len();
        assistants.retain(|_, record| !filter.matches(record));
        Ok((before - assistants.len()) as u64)
    }

    async fn get_assistants(
        &self,
        filter: &AssistantFilter,
    ) -> Result<Vec<AssistantRecord>, EngineError> {
        Ok(self
            .assistants
            .read()
            .expect("MemoryStore lock poisoned")
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    async fn save_search(&self, record: &SearchRecord) -> Result<(), EngineError> {
        self.searches
            .write()
            .expect("MemoryStore lock poisoned")
            .push(record.clone());
        Ok(())
    }
}
