//! Auto-search orchestration
//!
//! `Decide -> {Skip | BuildRequests -> Dispatch -> Merge -> Inject}`.

use super::keyword::extract_keywords;
use super::{
    build_reference_context, ReferenceContext, Request, SearchConfig, SearchResult, SearchType,
    SourceType,
};
use crate::assistant::{Assistant, HookCreateResponse};
use crate::context::{Context, Options};
use crate::output::{LoadingStatus, NullOutput};
use crate::runtime::Runtime;
use crate::store::{SearchRecord, SearchReferenceRecord};
use sdk::types::{Message, Role, Skip, Uses};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_WEB_LIMIT: usize = 10;
const DEFAULT_KB_LIMIT: usize = 10;
const DEFAULT_KB_THRESHOLD: f64 = 0.7;
const DEFAULT_DB_LIMIT: usize = 20;
const SNIPPET_CHARS: usize = 200;

/// Capability selection for this call: assistant, then hook, then caller
pub fn merged_uses(
    assistant: &Assistant,
    create: Option<&HookCreateResponse>,
    options: &Options,
) -> Uses {
    let mut uses = assistant.definition.uses.clone().unwrap_or_default();
    if let Some(hook_uses) = create.and_then(|c| c.uses.as_ref()) {
        uses = uses.merged_with(hook_uses);
    }
    if let Some(call_uses) = &options.uses {
        uses = uses.merged_with(call_uses);
    }
    uses
}

/// Search configuration for `assistant`, over the global defaults
pub fn effective_config(rt: &Runtime, assistant: &Assistant) -> SearchConfig {
    let global = rt.search_config();
    match &assistant.definition.search {
        Some(own) => own.merged_over(&global),
        None => global,
    }
}

fn has_search_config(assistant: &Assistant) -> bool {
    let def = &assistant.definition;
    def.search.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
        || def
            .kb
            .as_ref()
            .map(|kb| !kb.collections.is_empty())
            .unwrap_or(false)
        || def
            .db
            .as_ref()
            .map(|db| !db.models.is_empty())
            .unwrap_or(false)
}

/// The synchronous half of the decision: flags and configuration only
pub fn search_enabled(
    assistant: &Assistant,
    create: Option<&HookCreateResponse>,
    options: &Options,
) -> bool {
    if options.skip.search {
        return false;
    }

    let uses = merged_uses(assistant, create, options);
    if uses.search.as_deref() == Some("disabled") {
        return false;
    }

    if !has_search_config(assistant) && uses.search.is_none() {
        return false;
    }

    true
}

/// Decide whether this turn should run an automatic search
///
/// After the configuration checks pass, the intent agent is consulted.
/// Any failure to reach or parse it counts as "search".
pub async fn should_auto_search(
    rt: &Runtime,
    assistant: &Assistant,
    ctx: &Context,
    messages: &[Message],
    create: Option<&HookCreateResponse>,
    options: &Options,
) -> bool {
    if !search_enabled(assistant, create, options) {
        return false;
    }
    check_search_intent(rt, ctx, messages).await
}

async fn check_search_intent(rt: &Runtime, ctx: &Context, messages: &[Message]) -> bool {
    let Some(query) = last_user_text(messages) else {
        return false;
    };

    let agent_id = rt.needsearch_agent().to_string();
    let agent = match rt.get(&agent_id).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::debug!("Search intent agent '{}' unavailable: {}", agent_id, e);
            return true;
        }
    };

    let status = (!ctx.silent).then(|| {
        LoadingStatus::open(Arc::clone(&ctx.output), "Checking whether a search is needed")
    });

    let sub = Context {
        output: Arc::new(NullOutput),
        ..ctx.clone()
    };
    let options = Options {
        skip: Skip {
            history: true,
            search: true,
            output: true,
            ..Default::default()
        },
        ..Default::default()
    };

    let decision = match agent
        .run(rt, &sub, vec![Message::user(query)], options, None)
        .await
    {
        Ok(response) => {
            let content = response
                .completion
                .as_ref()
                .map(|c| c.content.as_str())
                .unwrap_or("");
            parse_intent(response.next.as_ref(), content).unwrap_or_else(|| {
                tracing::debug!("Unparsable search intent, defaulting to search");
                true
            })
        }
        Err(e) => {
            tracing::warn!("Search intent check failed, defaulting to search: {}", e);
            true
        }
    };

    if let Some(status) = status {
        status.done(if decision {
            "Search needed"
        } else {
            "No search needed"
        });
    }
    decision
}

/// Read `need_search` from the intent agent's answer
///
/// The hook result (`{data: {need_search}}` or `{need_search}`) wins over
/// the completion content, which may wrap the JSON in a markdown fence.
pub fn parse_intent(next: Option<&Value>, content: &str) -> Option<bool> {
    if let Some(next) = next {
        let flag = next
            .pointer("/data/need_search")
            .or_else(|| next.get("need_search"))
            .and_then(Value::as_bool);
        if flag.is_some() {
            return flag;
        }
    }

    let body = strip_code_fence(content);
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed.get("need_search").and_then(Value::as_bool)
}

/// Remove a surrounding ```json fence if present
pub(crate) fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

fn last_user_text(messages: &[Message]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(Message::text)
        .filter(|t| !t.trim().is_empty())
}

/// Build one request per configured backend
pub fn build_requests(
    assistant: &Assistant,
    config: &SearchConfig,
    query: &str,
    keywords: &[String],
) -> Vec<Request> {
    let mut requests = Vec::new();

    if let Some(web) = &config.web {
        let limit = web.max_results.unwrap_or(DEFAULT_WEB_LIMIT);
        let web_query = if keywords.is_empty() {
            query.to_string()
        } else {
            keywords.join(" ")
        };
        let mut request = Request::new(SearchType::Web, web_query, limit);
        request.keywords = keywords.to_vec();
        requests.push(request);
    }

    if let Some(kb) = assistant
        .definition
        .kb
        .as_ref()
        .filter(|kb| !kb.collections.is_empty())
    {
        let mut request = Request::new(SearchType::Kb, query, DEFAULT_KB_LIMIT);
        request.collections = kb.collections.clone();
        request.threshold = Some(
            config
                .kb
                .as_ref()
                .and_then(|c| c.threshold)
                .unwrap_or(DEFAULT_KB_THRESHOLD),
        );
        request.graph = config.kb.as_ref().map(|c| c.graph).unwrap_or(false);
        requests.push(request);
    }

    if let Some(db) = assistant
        .definition
        .db
        .as_ref()
        .filter(|db| !db.models.is_empty())
    {
        let limit = config
            .db
            .as_ref()
            .and_then(|c| c.max_results)
            .unwrap_or(DEFAULT_DB_LIMIT);
        let mut request = Request::new(SearchType::Db, query, limit);
        request.models = db.models.clone();
        requests.push(request);
    }

    for request in &mut requests {
        request.source = SourceType::Auto;
    }
    requests
}

/// Run the automatic search for this turn
///
/// Returns `None` when there is nothing to search or the dispatch failed;
/// the turn then continues without references.
pub async fn execute_auto_search(
    rt: &Runtime,
    assistant: &Assistant,
    ctx: &Context,
    messages: &[Message],
    create: Option<&HookCreateResponse>,
    options: &Options,
) -> Option<ReferenceContext> {
    let query = last_user_text(messages)?;
    let config = effective_config(rt, assistant);
    let uses = merged_uses(assistant, create, options);

    let mut keywords = Vec::new();
    if config.web.is_some() && !options.skip.keyword {
        if let Some(mechanism) = uses.keyword.as_deref() {
            match extract_keywords(rt, ctx, mechanism, &query).await {
                Ok(found) => keywords = found,
                Err(e) => tracing::warn!("Keyword extraction failed: {}", e),
            }
        }
    }

    let requests = build_requests(assistant, &config, &query, &keywords);
    if requests.is_empty() {
        return None;
    }

    let status = (!ctx.silent).then(|| LoadingStatus::open(Arc::clone(&ctx.output), "Searching"));
    let trace = ctx.tracer.as_ref().map(|tracer| {
        tracer.add(
            "Auto Search",
            "search",
            json!({ "query": query, "requests": requests }),
        )
    });

    let start = Instant::now();
    let outcome = rt.searcher().all(&requests, &config.weights()).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let mut record = SearchRecord {
        request_id: ctx.request_id.clone(),
        chat_id: ctx.chat_id.clone(),
        assistant_id: assistant.id().to_string(),
        query: query.clone(),
        keywords,
        config: config_snapshot(&config, &uses),
        source: SourceType::Auto.as_str().to_string(),
        references: Vec::new(),
        xml: String::new(),
        prompt: String::new(),
        duration_ms,
        error: None,
        created_at: chrono::Utc::now().timestamp_millis(),
    };

    let context = match outcome {
        Err(e) => {
            tracing::error!("Auto search failed for '{}': {}", assistant.id(), e);
            if let Some(status) = status {
                status.fail("Search failed");
            }
            if let Some(trace) = &trace {
                trace.fail(&e.to_string());
            }
            record.error = Some(e.to_string());
            None
        }
        Ok(results) => {
            let context = build_reference_context(&results, config.citation.as_ref());
            if let Some(status) = status {
                if context.references.is_empty() {
                    status.done("No references found");
                } else {
                    status.done(&format!("Found {} references", context.references.len()));
                }
            }
            if let Some(trace) = &trace {
                trace.complete(json!({
                    "references": context.references.len(),
                    "errors": partial_errors(&results),
                    "duration_ms": duration_ms,
                }));
            }
            record.references = to_store_references(&context);
            record.xml = context.xml.clone();
            record.prompt = context.prompt.clone();
            (!context.references.is_empty()).then_some(context)
        }
    };

    if let Some(store) = rt.store() {
        if let Err(e) = store.save_search(&record).await {
            tracing::warn!("Failed to save search record: {}", e);
        }
    }

    context
}

fn partial_errors(results: &[SearchResult]) -> Vec<String> {
    results
        .iter()
        .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.kind.as_str(), e)))
        .collect()
}

fn config_snapshot(config: &SearchConfig, uses: &Uses) -> Value {
    let mut snapshot = serde_json::to_value(config).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut snapshot {
        // Never persist credentials
        if let Some(Value::Object(web)) = map.get_mut("web") {
            web.remove("api_key");
        }
        map.insert(
            "uses".to_string(),
            serde_json::to_value(uses).unwrap_or(Value::Null),
        );
    }
    snapshot
}

fn to_store_references(context: &ReferenceContext) -> Vec<SearchReferenceRecord> {
    context
        .references
        .iter()
        .enumerate()
        .map(|(i, r)| SearchReferenceRecord {
            index: r.id.parse().unwrap_or(i + 1),
            kind: r.kind.as_str().to_string(),
            title: r.title.clone(),
            url: r.url.clone(),
            snippet: r.content.chars().take(SNIPPET_CHARS).collect(),
            content: r.content.clone(),
            metadata: json!({
                "weight": r.weight,
                "score": r.score,
                "source": r.source.as_str(),
            }),
        })
        .collect()
}

/// Insert the reference block as a system message
///
/// The message goes right after the leading run of system messages. An
/// empty reference block leaves the conversation unchanged.
pub fn inject_search_context(mut messages: Vec<Message>, context: &ReferenceContext) -> Vec<Message> {
    if context.xml.is_empty() {
        return messages;
    }

    let content = format!("{}\n\n{}", context.prompt, context.xml);
    let position = messages
        .iter()
        .position(|m| m.role != Role::System)
        .unwrap_or(messages.len());
    messages.insert(position, Message::system(content));
    messages
}
