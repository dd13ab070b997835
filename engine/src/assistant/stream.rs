//! Stream pipeline
//!
//! `Create hook -> Prompts -> Auto search -> Sandbox | Connector -> Next hook`.

use super::{Assistant, HookCreateResponse, Response};
use crate::context::{Context, Options};
use crate::output::{ChunkHandler, OutputMessage, OutputSink};
use crate::runtime::Runtime;
use crate::sandbox::stream_with_sandbox;
use crate::script::{AgentCallHost, HookScript, ScriptScope};
use crate::search::orchestrator::{execute_auto_search, inject_search_context, should_auto_search};
use crate::telemetry::turn_span;
use futures::future::BoxFuture;
use sdk::errors::EngineError;
use sdk::types::{ChunkKind, CompletionResponse, Message, StreamChunk};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::Instrument;

const CREATE_HOOK: &str = "Create";
const NEXT_HOOK: &str = "Next";

impl Assistant {
    /// Run one turn with default options
    pub async fn stream(
        &self,
        rt: &Runtime,
        ctx: &Context,
        messages: Vec<Message>,
        options: Options,
    ) -> Result<Response, EngineError> {
        self.run(rt, ctx, messages, options, None).await
    }

    /// Run one turn, reporting every chunk to `on_chunk` as well as the
    /// context's output sink
    ///
    /// Boxed because the search stage calls other assistants through this
    /// same entry point.
    pub fn run<'a>(
        &'a self,
        rt: &'a Runtime,
        ctx: &'a Context,
        messages: Vec<Message>,
        options: Options,
        on_chunk: Option<ChunkHandler>,
    ) -> BoxFuture<'a, Result<Response, EngineError>> {
        Box::pin(async move {
            let ctx = Context {
                assistant_id: self.id().to_string(),
                ..ctx.clone()
            };
            let span = turn_span(self.id(), &ctx.chat_id, &ctx.request_id);
            self.run_turn(rt, &ctx, messages, options, on_chunk)
                .instrument(span)
                .await
        })
    }

    async fn run_turn(
        &self,
        rt: &Runtime,
        ctx: &Context,
        messages: Vec<Message>,
        options: Options,
        on_chunk: Option<ChunkHandler>,
    ) -> Result<Response, EngineError> {
        tracing::debug!("Streaming {} message(s)", messages.len());

        let create = self.hook_create(rt, ctx, &messages, &options)?;
        let input = create
            .as_ref()
            .and_then(|c| c.messages.clone())
            .unwrap_or(messages);

        let mut request = self.prompt_messages();
        request.extend(input);

        let mut search = None;
        if should_auto_search(rt, self, ctx, &request, create.as_ref(), &options).await {
            if let Some(context) =
                execute_auto_search(rt, self, ctx, &request, create.as_ref(), &options).await
            {
                request = inject_search_context(request, &context);
                search = Some(context);
            }
        }

        let handler = chunk_handler(ctx, options.skip.output, on_chunk);
        let completion = if self.definition.sandbox.is_some() {
            stream_with_sandbox(rt, self, ctx, &request, handler).await?
        } else {
            self.stream_with_connector(rt, ctx, &request, create.as_ref(), &options, handler)
                .await?
        };

        let next = self.hook_next(rt, ctx, &completion)?;

        Ok(Response {
            assistant_id: self.id().to_string(),
            chat_id: ctx.chat_id.clone(),
            completion: Some(completion),
            next,
            search,
        })
    }

    /// Scripting entry point
    ///
    /// A string input becomes one user message, an array is read as a
    /// message list. Returns the `Next` hook value when there is one,
    /// otherwise the completion text.
    pub async fn execute(
        &self,
        rt: &Runtime,
        ctx: &Context,
        input: Value,
        llm_options: Map<String, Value>,
        on_chunk: Option<ChunkHandler>,
    ) -> Result<Value, EngineError> {
        let messages = input_messages(input)?;
        let options = Options {
            llm_options,
            ..Default::default()
        };

        let response = self.run(rt, ctx, messages, options, on_chunk).await?;
        if let Some(next) = response.next.filter(|v| !v.is_null()) {
            return Ok(next);
        }
        Ok(response
            .completion
            .map(|c| Value::String(c.content))
            .unwrap_or(Value::Null))
    }

    async fn stream_with_connector(
        &self,
        rt: &Runtime,
        ctx: &Context,
        messages: &[Message],
        create: Option<&HookCreateResponse>,
        options: &Options,
        handler: ChunkHandler,
    ) -> Result<CompletionResponse, EngineError> {
        let override_id = options
            .connector
            .as_deref()
            .or_else(|| create.and_then(|c| c.connector.as_deref()))
            .filter(|id| !id.is_empty());

        let connector = match override_id {
            Some(id) => rt.connectors().get(id)?,
            None => self.connector.clone().ok_or_else(|| {
                EngineError::NotConfigured(format!(
                    "assistant '{}' has no connector",
                    self.id()
                ))
            })?,
        };

        let mut llm_options = self.definition.options.clone();
        if let Some(hook_options) = create.and_then(|c| c.options.as_ref()) {
            llm_options.extend(hook_options.clone());
        }
        llm_options.extend(options.llm_options.clone());

        let trace = ctx
            .tracer
            .as_ref()
            .filter(|_| !options.skip.trace)
            .map(|tracer| {
                tracer.add(
                    "Completion",
                    "llm",
                    json!({ "connector": connector.id(), "messages": messages.len() }),
                )
            });

        let result = tokio::select! {
            result = connector.stream(messages, &llm_options, handler) => result.map_err(EngineError::from),
            _ = ctx.cancel.cancelled() => {
                Err(EngineError::Execution("completion cancelled".to_string()))
            }
        };

        if let Some(trace) = &trace {
            match &result {
                Ok(completion) => trace.complete(json!({
                    "model": completion.model,
                    "finish_reason": completion.finish_reason,
                })),
                Err(e) => trace.fail(&e.to_string()),
            }
        }
        result
    }

    fn hook_scope(&self, rt: &Runtime, ctx: &Context, script: &Arc<dyn HookScript>) -> ScriptScope {
        let host = AgentCallHost::new(rt.clone(), ctx.clone()).with_script(Arc::clone(script));
        ScriptScope::new(ctx.script_globals()).with_host(Arc::new(host))
    }

    fn hook_create(
        &self,
        rt: &Runtime,
        ctx: &Context,
        messages: &[Message],
        options: &Options,
    ) -> Result<Option<HookCreateResponse>, EngineError> {
        let Some(script) = &self.script else {
            return Ok(None);
        };
        let mut hook = script.new_context(&self.hook_scope(rt, ctx, script))?;
        if !hook.has(CREATE_HOOK) {
            return Ok(None);
        }

        let value = hook.call(
            CREATE_HOOK,
            &[serde_json::to_value(messages)?, serde_json::to_value(options)?],
        )?;
        if value.is_null() {
            return Ok(None);
        }
        let response = serde_json::from_value(value).map_err(|e| {
            EngineError::Parse(format!("{} hook of '{}': {}", CREATE_HOOK, self.id(), e))
        })?;
        Ok(Some(response))
    }

    fn hook_next(
        &self,
        rt: &Runtime,
        ctx: &Context,
        completion: &CompletionResponse,
    ) -> Result<Option<Value>, EngineError> {
        let Some(script) = &self.script else {
            return Ok(None);
        };
        let mut hook = script.new_context(&self.hook_scope(rt, ctx, script))?;
        if !hook.has(NEXT_HOOK) {
            return Ok(None);
        }

        let value = hook.call(NEXT_HOOK, &[json!({ "completion": completion })])?;
        Ok(Some(value).filter(|v| !v.is_null()))
    }
}

fn chunk_handler(ctx: &Context, skip_output: bool, on_chunk: Option<ChunkHandler>) -> ChunkHandler {
    let output: Option<Arc<dyn OutputSink>> = (!skip_output).then(|| Arc::clone(&ctx.output));
    Arc::new(move |chunk: &StreamChunk| {
        if let Some(output) = &output {
            let mut message = OutputMessage::text(chunk.text.clone());
            match chunk.kind {
                ChunkKind::Text => {}
                ChunkKind::Thinking => message.kind = "thinking".to_string(),
                ChunkKind::ToolCall => message.kind = "tool".to_string(),
            }
            if let Err(e) = output.send(message) {
                tracing::warn!("Failed to send chunk: {}", e);
            }
        }
        if let Some(on_chunk) = &on_chunk {
            on_chunk(chunk);
        }
    })
}

fn input_messages(input: Value) -> Result<Vec<Message>, EngineError> {
    match input {
        Value::String(text) => Ok(vec![Message::user(text)]),
        Value::Array(_) => Ok(serde_json::from_value(input)?),
        Value::Object(_) => Ok(vec![serde_json::from_value(input)?]),
        other => Err(EngineError::Validation(format!(
            "input must be a string or a message list, got {}",
            other
        ))),
    }
}
