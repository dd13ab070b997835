//! Canonical decoding of assistant records
//!
//! Records arrive from package files, the store and API payloads, and the
//! same field can take several shapes. Each polymorphic field has one
//! function here that maps every accepted shape onto one canonical value.

use super::{
    AssistantDefinition, DatabaseRef, KnowledgeBase, McpServerRef, McpServers, Placeholder, Prompt,
    Tool, ToolCalls,
};
use chrono::{DateTime, NaiveDateTime};
use sdk::errors::EngineError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Build a definition from a record
///
/// `assistant_id` (or `id`) and `name` are required non-empty strings.
pub fn definition_from_map(data: &Map<String, Value>) -> Result<AssistantDefinition, EngineError> {
    let id = required_str(data, &["assistant_id", "id"])?;
    let name = required_str(data, &["name"])?;

    let prompts = match data.get("prompts") {
        Some(v) => normalize_prompts(v)?,
        None => Vec::new(),
    };
    let tools = match data.get("tools") {
        Some(v) => normalize_tools(v, &prompts)?,
        None => None,
    };

    Ok(AssistantDefinition {
        id,
        name,
        kind: optional_str(data, "type")?.unwrap_or_else(|| "assistant".to_string()),
        avatar: optional_str(data, "avatar")?,
        connector: optional_str(data, "connector")?.unwrap_or_default(),
        path: optional_str(data, "path")?,
        description: optional_str(data, "description")?,
        options: optional_object(data, "options")?,
        connector_options: optional_object(data, "connector_options")?,
        prompts,
        tags: match data.get("tags") {
            Some(v) => normalize_tags(v)?,
            None => Vec::new(),
        },
        placeholder: match data.get("placeholder") {
            Some(v) => normalize_placeholder(v)?,
            None => None,
        },
        tools,
        mcp: match data.get("mcp") {
            Some(v) => normalize_mcp(v)?,
            None => None,
        },
        kb: typed::<KnowledgeBase>(data, "kb")?,
        db: typed::<DatabaseRef>(data, "db")?,
        search: typed(data, "search")?,
        uses: typed(data, "uses")?,
        sandbox: typed(data, "sandbox")?,
        locales: typed::<BTreeMap<String, Map<String, Value>>>(data, "locales")?.unwrap_or_default(),
        readonly: flag(data, "readonly"),
        public: flag(data, "public"),
        built_in: flag(data, "built_in"),
        mentionable: flag(data, "mentionable"),
        automated: flag(data, "automated"),
        sort: match data.get("sort") {
            Some(v) => normalize_sort(v)?,
            None => 0,
        },
        created_at: match data.get("created_at") {
            Some(v) => normalize_timestamp(v)?,
            None => 0,
        },
        updated_at: match data.get("updated_at") {
            Some(v) => normalize_timestamp(v)?,
            None => 0,
        },
        source: optional_str(data, "source")?,
    })
}

fn required_str(data: &Map<String, Value>, keys: &[&str]) -> Result<String, EngineError> {
    let value = keys.iter().find_map(|k| data.get(*k).filter(|v| !v.is_null()));
    match value {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None => Err(EngineError::Validation(format!(
            "{} is required",
            keys[0]
        ))),
        Some(other) => Err(EngineError::Validation(format!(
            "{} must be a string, got {}",
            keys[0],
            type_name(other)
        ))),
    }
}

fn optional_str(data: &Map<String, Value>, key: &str) -> Result<Option<String>, EngineError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(EngineError::Validation(format!(
            "{} must be a string, got {}",
            key,
            type_name(other)
        ))),
    }
}

fn optional_object(
    data: &Map<String, Value>,
    key: &str,
) -> Result<Map<String, Value>, EngineError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(EngineError::Validation(format!(
            "{} must be an object, got {}",
            key,
            type_name(other)
        ))),
    }
}

fn typed<T: DeserializeOwned>(
    data: &Map<String, Value>,
    key: &str,
) -> Result<Option<T>, EngineError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) if raw.trim_start().starts_with('{') => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| EngineError::Parse(format!("{}: {}", key, e))),
        Some(v) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| EngineError::Parse(format!("{}: {}", key, e))),
    }
}

fn flag(data: &Map<String, Value>, key: &str) -> bool {
    data.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Tags: a single string, a list of strings, or a list of scalars
pub fn normalize_tags(value: &Value) -> Result<Vec<String>, EngineError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim_start().starts_with('[') => {
            let parsed: Value = serde_json::from_str(s)
                .map_err(|e| EngineError::Parse(format!("tags: {}", e)))?;
            normalize_tags(&parsed)
        }
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                scalar_to_string(item).ok_or_else(|| {
                    EngineError::Parse(format!("tags: unexpected {} item", type_name(item)))
                })
            })
            .collect(),
        other => Err(EngineError::Parse(format!(
            "tags: unexpected {}",
            type_name(other)
        ))),
    }
}

/// Placeholder: an object, its JSON encoding, or a bare title
pub fn normalize_placeholder(value: &Value) -> Result<Option<Placeholder>, EngineError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(_) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| EngineError::Parse(format!("placeholder: {}", e))),
        Value::String(s) if s.trim_start().starts_with('{') => serde_json::from_str(s)
            .map(Some)
            .map_err(|e| EngineError::Parse(format!("placeholder: {}", e))),
        Value::String(s) => Ok(Some(Placeholder {
            title: s.clone(),
            ..Default::default()
        })),
        other => Err(EngineError::Parse(format!(
            "placeholder: unexpected {}",
            type_name(other)
        ))),
    }
}

/// Prompts: a list of prompt objects or its JSON encoding
pub fn normalize_prompts(value: &Value) -> Result<Vec<Prompt>, EngineError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| EngineError::Parse(format!("prompts: {}", e))),
        Value::Array(_) => serde_json::from_value(value.clone())
            .map_err(|e| EngineError::Parse(format!("prompts: {}", e))),
        other => Err(EngineError::Parse(format!(
            "prompts: unexpected {}",
            type_name(other)
        ))),
    }
}

/// Tools: a bare tool list, a `{tools, prompts}` object, or the JSON text of either
///
/// A bare list borrows the assistant prompts.
pub fn normalize_tools(value: &Value, prompts: &[Prompt]) -> Result<Option<ToolCalls>, EngineError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => {
            let parsed: Value = serde_json::from_str(s)
                .map_err(|e| EngineError::Parse(format!("tools format error: {}", e)))?;
            normalize_tools(&parsed, prompts)
        }
        Value::Array(_) => {
            let tools: Vec<Tool> = serde_json::from_value(value.clone())
                .map_err(|e| EngineError::Parse(format!("tools format error: {}", e)))?;
            Ok(Some(ToolCalls {
                tools,
                prompts: prompts.to_vec(),
            }))
        }
        Value::Object(_) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| EngineError::Parse(format!("tools format error: {}", e))),
        other => Err(EngineError::Parse(format!(
            "tools format error: unexpected {}",
            type_name(other)
        ))),
    }
}

/// MCP servers: `{servers: [...]}` or the bare list
///
/// Each entry is `"id"`, `{server_id, tools}`, `{"id": [tools]}` or
/// `{"id": {tools, resources}}`.
pub fn normalize_mcp(value: &Value) -> Result<Option<McpServers>, EngineError> {
    let (servers, options) = match value {
        Value::Null => return Ok(None),
        Value::Array(items) => (items.as_slice(), Map::new()),
        Value::Object(map) => {
            let items = match map.get("servers") {
                Some(Value::Array(items)) => items.as_slice(),
                None | Some(Value::Null) => &[],
                Some(other) => {
                    return Err(EngineError::Parse(format!(
                        "mcp.servers: unexpected {}",
                        type_name(other)
                    )))
                }
            };
            let options = map
                .get("options")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            (items, options)
        }
        other => {
            return Err(EngineError::Parse(format!(
                "mcp: unexpected {}",
                type_name(other)
            )))
        }
    };

    let servers = servers
        .iter()
        .map(normalize_mcp_server)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(McpServers { servers, options }))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(scalar_to_string).collect())
        .unwrap_or_default()
}

fn normalize_mcp_server(value: &Value) -> Result<McpServerRef, EngineError> {
    match value {
        Value::String(id) => Ok(McpServerRef {
            server_id: id.clone(),
            ..Default::default()
        }),
        Value::Object(map) if map.contains_key("server_id") => serde_json::from_value(value.clone())
            .map_err(|e| EngineError::Parse(format!("mcp server: {}", e))),
        Value::Object(map) if map.len() == 1 => {
            let Some((id, entry)) = map.iter().next() else {
                return Err(EngineError::Parse("mcp server: empty entry".to_string()));
            };
            match entry {
                Value::Array(_) => Ok(McpServerRef {
                    server_id: id.clone(),
                    tools: string_list(Some(entry)),
                    resources: Vec::new(),
                }),
                Value::Object(inner) => Ok(McpServerRef {
                    server_id: id.clone(),
                    tools: string_list(inner.get("tools")),
                    resources: string_list(inner.get("resources")),
                }),
                other => Err(EngineError::Parse(format!(
                    "mcp server '{}': unexpected {}",
                    id,
                    type_name(other)
                ))),
            }
        }
        other => Err(EngineError::Parse(format!(
            "mcp server: unexpected {}",
            type_name(other)
        ))),
    }
}

/// Sort order: an integer or a numeric string
pub fn normalize_sort(value: &Value) -> Result<i64, EngineError> {
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| EngineError::Parse(format!("sort: invalid number {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| EngineError::Parse(format!("sort: '{}' is not a number", s))),
        other => Err(EngineError::Parse(format!(
            "sort: unexpected {}",
            type_name(other)
        ))),
    }
}

/// Timestamp in nanoseconds from an integer, RFC 3339 or `YYYY-MM-DD HH:MM:SS`
pub fn normalize_timestamp(value: &Value) -> Result<i64, EngineError> {
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| EngineError::Parse(format!("timestamp: invalid number {}", n))),
        Value::String(s) => parse_timestamp_str(s.trim()),
        other => Err(EngineError::Parse(format!(
            "timestamp: unexpected {}",
            type_name(other)
        ))),
    }
}

fn parse_timestamp_str(s: &str) -> Result<i64, EngineError> {
    if s.is_empty() {
        return Ok(0);
    }
    if let Ok(n) = s.parse::<i64>() {
        return Ok(n);
    }

    let nanos = if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        dt.timestamp_nanos_opt()
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        dt.and_utc().timestamp_nanos_opt()
    } else {
        return Err(EngineError::Parse(format!("timestamp: unrecognized '{}'", s)));
    };

    nanos.ok_or_else(|| EngineError::Parse(format!("timestamp: out of range '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(extra: Value) -> Map<String, Value> {
        let mut base = json!({ "assistant_id": "tests.basic", "name": "Basic" })
            .as_object()
            .cloned()
            .unwrap();
        if let Value::Object(extra) = extra {
            base.extend(extra);
        }
        base
    }

    #[test]
    fn test_required_fields() {
        let missing = json!({ "name": "x" }).as_object().cloned().unwrap();
        assert!(matches!(
            definition_from_map(&missing),
            Err(EngineError::Validation(_))
        ));

        let wrong_type = json!({ "assistant_id": "a", "name": 3 })
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(
            definition_from_map(&wrong_type),
            Err(EngineError::Validation(_))
        ));

        let empty_name = json!({ "assistant_id": "a", "name": "" })
            .as_object()
            .cloned()
            .unwrap();
        assert!(definition_from_map(&empty_name).is_err());
    }

    #[test]
    fn test_tags_shapes_agree() {
        assert_eq!(normalize_tags(&json!("chat")).unwrap(), vec!["chat"]);
        assert_eq!(
            normalize_tags(&json!(["chat", "tools"])).unwrap(),
            normalize_tags(&json!(r#"["chat","tools"]"#)).unwrap()
        );
        assert_eq!(normalize_tags(&json!(["v", 2])).unwrap(), vec!["v", "2"]);
        assert!(normalize_tags(&json!({ "a": 1 })).is_err());
    }

    #[test]
    fn test_placeholder_shapes() {
        let from_object = normalize_placeholder(&json!({ "title": "Hi", "prompts": ["a"] }))
            .unwrap()
            .unwrap();
        let from_json = normalize_placeholder(&json!(r#"{"title":"Hi","prompts":["a"]}"#))
            .unwrap()
            .unwrap();
        assert_eq!(from_object, from_json);

        let bare = normalize_placeholder(&json!("Ask me")).unwrap().unwrap();
        assert_eq!(bare.title, "Ask me");
        assert!(normalize_placeholder(&Value::Null).unwrap().is_none());
    }

    #[test]
    fn test_tools_shapes() {
        let prompts = vec![Prompt::system("use tools")];
        let list = json!([{ "type": "function", "name": "lookup" }]);

        let from_list = normalize_tools(&list, &prompts).unwrap().unwrap();
        assert_eq!(from_list.tools[0].name, "lookup");
        assert_eq!(from_list.prompts, prompts);

        let object = json!({ "tools": [{ "name": "lookup" }], "prompts": [] });
        let from_object = normalize_tools(&object, &prompts).unwrap().unwrap();
        let from_text = normalize_tools(&json!(object.to_string()), &prompts)
            .unwrap()
            .unwrap();
        assert_eq!(from_object, from_text);
        assert!(from_object.prompts.is_empty());

        assert!(matches!(
            normalize_tools(&json!("{not json"), &prompts),
            Err(EngineError::Parse(_))
        ));
    }

    #[test]
    fn test_mcp_server_shapes() {
        let mcp = normalize_mcp(&json!({
            "servers": [
                "echo",
                { "server_id": "files", "tools": ["read"] },
                { "search": ["web", "news"] },
                { "db": { "tools": ["query"], "resources": ["schema"] } },
            ]
        }))
        .unwrap()
        .unwrap();

        let ids: Vec<&str> = mcp.servers.iter().map(|s| s.server_id.as_str()).collect();
        assert_eq!(ids, vec!["echo", "files", "search", "db"]);
        assert_eq!(mcp.servers[2].tools, vec!["web", "news"]);
        assert_eq!(mcp.servers[3].resources, vec!["schema"]);
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(normalize_timestamp(&json!(42)).unwrap(), 42);
        assert_eq!(
            normalize_timestamp(&json!("1970-01-01 00:00:01")).unwrap(),
            1_000_000_000
        );
        assert_eq!(
            normalize_timestamp(&json!("1970-01-01T00:00:02Z")).unwrap(),
            2_000_000_000
        );
        assert!(normalize_timestamp(&json!("yesterday")).is_err());
    }

    #[test]
    fn test_definition_defaults() {
        let def = definition_from_map(&record(json!({ "sort": "7" }))).unwrap();
        assert_eq!(def.kind, "assistant");
        assert_eq!(def.sort, 7);
        assert!(def.tags.is_empty());
        assert!(def.tools.is_none());
    }
}
