use super::orchestrator::strip_code_fence;
use crate::context::{Context, Options};
use crate::output::NullOutput;
use crate::runtime::Runtime;
use sdk::errors::EngineError;
use sdk::types::{Message, Skip};
use serde_json::Value;
use std::sync::Arc;

const MAX_KEYWORDS: usize = 10;

/// Extract search keywords from `query`
///
/// `mechanism` is `builtin` (the configured keyword agent), `disabled`,
/// or an assistant id optionally prefixed with `agent:`.
pub async fn extract_keywords(
    rt: &Runtime,
    ctx: &Context,
    mechanism: &str,
    query: &str,
) -> Result<Vec<String>, EngineError> {
    let agent_id = match mechanism {
        "" | "disabled" => return Ok(Vec::new()),
        "builtin" => rt.keyword_agent().to_string(),
        other => other.strip_prefix("agent:").unwrap_or(other).to_string(),
    };

    let agent = rt.get(&agent_id).await?;
    let sub = Context {
        output: Arc::new(NullOutput),
        silent: true,
        ..ctx.clone()
    };
    let options = Options {
        skip: Skip {
            history: true,
            search: true,
            output: true,
            keyword: true,
            ..Default::default()
        },
        ..Default::default()
    };

    let response = agent
        .run(rt, &sub, vec![Message::user(query)], options, None)
        .await?;
    let content = response
        .completion
        .as_ref()
        .map(|c| c.content.as_str())
        .unwrap_or("");

    let keywords = parse_keywords(response.next.as_ref(), content);
    tracing::debug!("Extracted {} keyword(s) for search", keywords.len());
    Ok(keywords)
}

/// Keywords from a hook value or completion text
///
/// Accepts a JSON array of strings or of `{keyword}` objects (optionally
/// fenced or under `data`), falling back to a comma-separated list.
pub fn parse_keywords(next: Option<&Value>, content: &str) -> Vec<String> {
    if let Some(next) = next {
        let list = next.get("data").unwrap_or(next);
        let found = keywords_from_value(list);
        if !found.is_empty() {
            return found;
        }
    }

    let body = strip_code_fence(content);
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let found = keywords_from_value(&value);
        if !found.is_empty() {
            return found;
        }
    }

    body.split([',', '\n'])
        .map(|k| k.trim().trim_matches('"').to_string())
        .filter(|k| !k.is_empty())
        .take(MAX_KEYWORDS)
        .collect()
}

fn keywords_from_value(value: &Value) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return value
            .get("keywords")
            .map(keywords_from_value)
            .unwrap_or_default();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(o) => o
                .get("keyword")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|k| !k.is_empty())
        .take(MAX_KEYWORDS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_keywords_shapes() {
        assert_eq!(
            parse_keywords(Some(&json!(["rust", "tokio"])), ""),
            vec!["rust", "tokio"]
        );
        assert_eq!(
            parse_keywords(
                Some(&json!({"data": [{"keyword": "lru", "weight": 0.9}]})),
                ""
            ),
            vec!["lru"]
        );
        assert_eq!(
            parse_keywords(None, "```json\n{\"keywords\": [\"cache\"]}\n```"),
            vec!["cache"]
        );
        assert_eq!(parse_keywords(None, "alpha, beta ,gamma"), vec!["alpha", "beta", "gamma"]);
    }
}
