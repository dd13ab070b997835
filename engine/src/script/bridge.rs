//! Assistant calls from scripts
//!
//! An [`AgentCall`] is bound to a target assistant and an input, optionally
//! given callbacks for the `done`, `retry` and `message` events, then run.
//! Each run uses a fresh `call_<uuid>` chat and is marked as coming from a
//! script. A failed attempt is retried with a rewritten last user message
//! until the retry budget is spent.
//!
//! Scripts reach this through [`AgentCallHost`], which decodes a JSON
//! request:
//!
//! ```json
//! {
//!   "assistant_id": "tests.echo",
//!   "input": "hello",
//!   "options": { "silent": true, "retry": { "times": 2 } },
//!   "on": { "message": "OnMessage", "done": "OnDone" },
//!   "args": [1, 2]
//! }
//! ```

use super::{HookScript, ScriptHost, ScriptScope};
use crate::context::{Context, Referer};
use crate::output::ChunkHandler;
use crate::runtime::Runtime;
use sdk::errors::EngineError;
use sdk::types::{Message, Role, StreamChunk};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Events a call accepts callbacks for
pub const ALLOWED_EVENTS: &[&str] = &["done", "retry", "message"];

const DEFAULT_RETRY_PROMPT: &str = "{{ input }}\n**Answer is not correct, please try again.**\nError:\n{{ error }} \nAssistant's last answer:\n{{ output }}";

fn default_retry_times() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    200
}

fn default_retry_delay_max() -> u64 {
    1000
}

fn default_retry_prompt() -> String {
    DEFAULT_RETRY_PROMPT.to_string()
}

fn default_silent() -> bool {
    true
}

/// Retry policy of a call
///
/// Delays are in milliseconds; attempt `n` waits `delay * n`, capped at
/// `delay_max`. The prompt template may use `{{ input }}`, `{{ error }}`
/// and `{{ output }}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    #[serde(default = "default_retry_times")]
    pub times: u32,
    #[serde(default = "default_retry_delay")]
    pub delay: u64,
    #[serde(default = "default_retry_delay_max")]
    pub delay_max: u64,
    #[serde(default = "default_retry_prompt")]
    pub prompt: String,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            times: default_retry_times(),
            delay: default_retry_delay(),
            delay_max: default_retry_delay_max(),
            prompt: default_retry_prompt(),
        }
    }
}

impl RetryOptions {
    /// Delay before retry attempt `attempt` (2 for the first retry)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.delay
                .saturating_mul(u64::from(attempt))
                .min(self.delay_max),
        )
    }

    /// Render the retry prompt
    pub fn render(&self, input: &str, error: &str, output: &str) -> String {
        self.prompt
            .replace("{{ input }}", input)
            .replace("{{ error }}", error)
            .replace("{{ output }}", output)
    }
}

/// Options of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    #[serde(default)]
    pub retry: RetryOptions,
    /// Model options passed to the target assistant
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Suppress status messages of the target assistant
    #[serde(default = "default_silent")]
    pub silent: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retry: RetryOptions::default(),
            options: Map::new(),
            silent: default_silent(),
        }
    }
}

impl CallOptions {
    /// Decode options given as an object, a JSON string or nothing
    pub fn from_value(value: Option<&Value>) -> Result<Self, EngineError> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::String(raw)) if raw.trim().is_empty() => Ok(Self::default()),
            Some(Value::String(raw)) => Ok(serde_json::from_str(raw)?),
            Some(value) => Ok(serde_json::from_value(value.clone())?),
        }
    }
}

/// Native callback: receives the event arguments
pub type NativeCallback = Arc<dyn Fn(&[Value]) -> Result<Value, EngineError> + Send + Sync>;

/// Something to run when a call event fires
#[derive(Clone)]
pub enum Callback {
    /// An exported function of a script, run in a fresh context
    Script {
        script: Arc<dyn HookScript>,
        function: String,
    },
    Native(NativeCallback),
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Script { script, function } => f
                .debug_struct("Script")
                .field("script", &script.id())
                .field("function", function)
                .finish(),
            Callback::Native(_) => f.write_str("Native"),
        }
    }
}

impl Callback {
    fn invoke(&self, globals: &Map<String, Value>, args: &[Value]) -> Result<Value, EngineError> {
        match self {
            Callback::Script { script, function } => {
                let mut ctx = script.new_context(&ScriptScope::new(globals.clone()))?;
                ctx.call(function, args)
            }
            Callback::Native(f) => f(args),
        }
    }
}

/// A call from a script into another assistant
pub struct AgentCall {
    rt: Runtime,
    ctx: Context,
    globals: Map<String, Value>,
    target: String,
    input: Value,
    options: CallOptions,
    events: HashMap<String, Callback>,
}

impl fmt::Debug for AgentCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentCall")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AgentCall {
    /// A call made on behalf of `ctx`; callbacks see the globals of `ctx`
    pub fn new(rt: Runtime, ctx: Context) -> Self {
        let globals = ctx.script_globals();
        Self {
            rt,
            ctx,
            globals,
            target: String::new(),
            input: Value::Null,
            options: CallOptions::default(),
            events: HashMap::new(),
        }
    }

    /// Set the target assistant, the input and the options
    pub fn bind(&mut self, target: impl Into<String>, input: Value, options: CallOptions) -> &mut Self {
        self.target = target.into();
        self.input = input;
        self.options = options;
        self
    }

    /// Register a callback; only `done`, `retry` and `message` are accepted
    pub fn on(&mut self, event: &str, callback: Callback) -> Result<&mut Self, EngineError> {
        if !ALLOWED_EVENTS.contains(&event) {
            return Err(EngineError::Validation(format!("Invalid event {}", event)));
        }
        self.events.insert(event.to_string(), callback);
        Ok(self)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    /// Run the call
    ///
    /// Returns the `done` callback's value when it returns one, otherwise
    /// the target's result.
    pub async fn run(&self, args: Vec<Value>) -> Result<Value, EngineError> {
        if self.target.is_empty() {
            return Err(EngineError::Validation(
                "assistant call has no target".to_string(),
            ));
        }

        let assistant = self.rt.get(&self.target).await?;
        let retry = &self.options.retry;
        let mut input = self.input.clone();
        let mut attempt: u32 = 1;

        loop {
            let mut globals = self.globals.clone();
            globals.insert("args".to_string(), Value::Array(args.clone()));
            globals.insert("retry_times".to_string(), json!(attempt));

            let output = Arc::new(Mutex::new(String::new()));
            let ctx = Context {
                chat_id: format!("call_{}", uuid::Uuid::new_v4()),
                assistant_id: self.target.clone(),
                referer: Referer::Script,
                silent: self.options.silent,
                args: args.clone(),
                ..self.ctx.clone()
            };

            let handler = self.message_handler(Arc::clone(&output), globals.clone());
            let result = match assistant
                .execute(&self.rt, &ctx, input.clone(), self.options.options.clone(), Some(handler))
                .await
            {
                Ok(value) => self.trigger_done(&globals, value, &args),
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if retry.times == 0 {
                return Err(error);
            }
            if attempt > retry.times {
                return Err(EngineError::Execution(format!(
                    "{} occurred, max retry times reached",
                    error
                )));
            }
            attempt += 1;

            let delay = retry.delay_for(attempt);
            tracing::debug!(
                "Retrying call to '{}' (attempt {}) in {:?}: {}",
                self.target,
                attempt,
                delay,
                error
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let last_output = output.lock().expect("call output lock poisoned").trim().to_string();
            let mut prompt = retry.render(&last_user_text(&input)?, &error.to_string(), &last_output);

            if let Some(callback) = self.events.get("retry") {
                globals.insert("error".to_string(), Value::String(error.to_string()));
                let custom = callback
                    .invoke(
                        &globals,
                        &[json!(attempt), json!(delay.as_millis() as u64), json!(prompt)],
                    )
                    .map_err(|e| {
                        EngineError::Execution(format!(
                            "{} occurred but failed to trigger the retry event: {}",
                            error, e
                        ))
                    })?;
                if let Value::String(custom) = custom {
                    prompt = custom;
                }
            }

            input = retry_input(&input, prompt)?;
        }
    }

    fn message_handler(&self, output: Arc<Mutex<String>>, globals: Map<String, Value>) -> ChunkHandler {
        let callback = self.events.get("message").cloned();
        Arc::new(move |chunk: &StreamChunk| {
            output
                .lock()
                .expect("call output lock poisoned")
                .push_str(&chunk.text);

            if let Some(callback) = &callback {
                let message = json!({ "type": chunk.kind, "text": chunk.text });
                if let Err(e) = callback.invoke(&globals, &[message]) {
                    tracing::error!("Failed to trigger the message event: {}", e);
                }
            }
        })
    }

    fn trigger_done(
        &self,
        globals: &Map<String, Value>,
        value: Value,
        args: &[Value],
    ) -> Result<Value, EngineError> {
        let Some(callback) = self.events.get("done") else {
            return Ok(value);
        };

        let mut done_args = vec![value.clone()];
        done_args.extend_from_slice(args);
        let done = callback.invoke(globals, &done_args)?;
        Ok(if done.is_null() { value } else { done })
    }
}

/// Text of the last user message of an input
fn last_user_text(input: &Value) -> Result<String, EngineError> {
    match input {
        Value::String(text) => Ok(text.clone()),
        Value::Array(_) => {
            let messages: Vec<Message> = serde_json::from_value(input.clone())?;
            Ok(messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(Message::text)
                .unwrap_or_default())
        }
        Value::Object(_) => {
            let message: Message = serde_json::from_value(input.clone())?;
            Ok(message.text())
        }
        other => Err(EngineError::Validation(format!(
            "cannot retry input {}",
            other
        ))),
    }
}

/// The input with its last user message replaced by `prompt`
fn retry_input(input: &Value, prompt: String) -> Result<Value, EngineError> {
    match input {
        Value::Array(_) => {
            let mut messages: Vec<Message> = serde_json::from_value(input.clone())?;
            match messages.iter_mut().rev().find(|m| m.role == Role::User) {
                Some(message) => message.content = prompt.into(),
                None => messages.push(Message::user(prompt)),
            }
            Ok(serde_json::to_value(messages)?)
        }
        _ => Ok(serde_json::to_value(vec![Message::user(prompt)])?),
    }
}

#[derive(Debug, Deserialize)]
struct AgentCallRequest {
    assistant_id: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    options: Option<Value>,
    /// Event -> exported function of the calling script
    #[serde(default)]
    on: BTreeMap<String, String>,
    #[serde(default)]
    args: Vec<Value>,
}

/// [`ScriptHost`] that runs assistant calls for a script
///
/// Scripts run synchronously, so the call blocks the current worker thread
/// until the target assistant finishes. This needs the multi-threaded tokio
/// runtime.
#[derive(Clone)]
pub struct AgentCallHost {
    rt: Runtime,
    ctx: Context,
    script: Option<Arc<dyn HookScript>>,
}

impl AgentCallHost {
    pub fn new(rt: Runtime, ctx: Context) -> Self {
        Self {
            rt,
            ctx,
            script: None,
        }
    }

    /// Script whose exported functions serve as event callbacks
    pub fn with_script(mut self, script: Arc<dyn HookScript>) -> Self {
        self.script = Some(script);
        self
    }

    fn prepare(&self, request: Value) -> Result<(AgentCall, Vec<Value>), EngineError> {
        let request: AgentCallRequest = serde_json::from_value(request)?;
        let options = CallOptions::from_value(request.options.as_ref())?;

        let mut call = AgentCall::new(self.rt.clone(), self.ctx.clone());
        call.bind(request.assistant_id, request.input, options);

        for (event, function) in request.on {
            let script = self.script.clone().ok_or_else(|| {
                EngineError::Validation(format!(
                    "callback '{}' for event {} needs a calling script",
                    function, event
                ))
            })?;
            call.on(&event, Callback::Script { script, function })?;
        }
        Ok((call, request.args))
    }
}

impl ScriptHost for AgentCallHost {
    fn call_agent(&self, request: Value) -> Result<Value, EngineError> {
        let (call, args) = self.prepare(request)?;

        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            EngineError::Execution("assistant calls need a tokio runtime".to_string())
        })?;
        if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
            return Err(EngineError::Execution(
                "assistant calls need the multi-threaded tokio runtime".to_string(),
            ));
        }

        tokio::task::block_in_place(|| handle.block_on(call.run(args)))
    }
}
