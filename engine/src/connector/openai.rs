use super::{Connector, ConnectorError};
use crate::output::ChunkHandler;
use async_trait::async_trait;
use futures::StreamExt;
use sdk::types::{CompletionResponse, Message, Role, StreamChunk};
use serde_json::{json, Map, Value};

/// OpenAI-compatible chat completions endpoint
pub struct OpenAIConnector {
    id: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    options: Map<String, Value>,
    client: reqwest::Client,
}

impl OpenAIConnector {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        options: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            options,
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, messages: &[Message], options: &Map<String, Value>) -> Value {
        let mut payload = Map::new();
        for (k, v) in self.options.iter().chain(options.iter()) {
            payload.insert(k.clone(), v.clone());
        }
        payload.insert("model".into(), json!(self.model));
        payload.insert("messages".into(), json!(messages));
        payload.insert("stream".into(), json!(true));
        Value::Object(payload)
    }
}

#[async_trait]
impl Connector for OpenAIConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn setting(&self) -> Map<String, Value> {
        let mut setting = self.options.clone();
        setting.insert("type".into(), json!("openai"));
        setting.insert("host".into(), json!(self.base_url));
        setting.insert("model".into(), json!(self.model));
        if let Some(key) = &self.api_key {
            setting.insert("key".into(), json!(key));
        }
        setting
    }

    fn is(&self, kind: &str) -> bool {
        kind.eq_ignore_ascii_case("openai")
    }

    async fn stream(
        &self,
        messages: &[Message],
        options: &Map<String, Value>,
        handler: ChunkHandler,
    ) -> Result<CompletionResponse, ConnectorError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.payload(messages, options));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConnectorError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(ConnectorError::Authentication(text));
            } else if status.as_u16() == 429 {
                return Err(ConnectorError::RateLimited);
            } else {
                return Err(ConnectorError::InvalidRequest(text));
            }
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        let mut completion = CompletionResponse {
            model: self.model.clone(),
            role: Role::Assistant,
            created: chrono::Utc::now().timestamp(),
            ..Default::default()
        };

        if !is_event_stream {
            // Servers may ignore `stream: true` and answer with one JSON body
            let data: Value = response
                .json()
                .await
                .map_err(|e| ConnectorError::Parse(e.to_string()))?;
            let content = data
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .ok_or_else(|| ConnectorError::Parse("No choices in response".to_string()))?;
            handler(&StreamChunk::text(content));
            apply_metadata(&mut completion, &data);
            completion.finish_reason = data
                .pointer("/choices/0/finish_reason")
                .and_then(Value::as_str)
                .map(String::from);
            completion.content = content.to_string();
            return Ok(completion);
        }

        let mut body = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(bytes) = body.next().await {
            let bytes = bytes.map_err(|e| ConnectorError::Network(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                if apply_event_line(line.trim(), &mut completion, &handler)? {
                    return Ok(completion);
                }
            }
        }
        apply_event_line(buffer.trim(), &mut completion, &handler)?;

        Ok(completion)
    }
}

fn apply_metadata(completion: &mut CompletionResponse, data: &Value) {
    if let Some(id) = data.get("id").and_then(Value::as_str) {
        completion.id = id.to_string();
    }
    if let Some(model) = data.get("model").and_then(Value::as_str) {
        completion.model = model.to_string();
    }
    if let Some(created) = data.get("created").and_then(Value::as_i64) {
        completion.created = created;
    }
}

/// Apply one server-sent event line; returns true at `[DONE]`
fn apply_event_line(
    line: &str,
    completion: &mut CompletionResponse,
    handler: &ChunkHandler,
) -> Result<bool, ConnectorError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(false);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(false);
    }
    if data == "[DONE]" {
        return Ok(true);
    }

    let event: Value =
        serde_json::from_str(data).map_err(|e| ConnectorError::Parse(e.to_string()))?;
    if completion.id.is_empty() {
        apply_metadata(completion, &event);
    }
    if let Some(delta) = event
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
    {
        if !delta.is_empty() {
            handler(&StreamChunk::text(delta));
            completion.content.push_str(delta);
        }
    }
    if let Some(reason) = event
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str)
    {
        completion.finish_reason = Some(reason.to_string());
    }
    Ok(false)
}
