//! In-process doubles for the engine's external collaborators
#![allow(dead_code)]

use async_trait::async_trait;
use atrium_engine::connector::{Connector, ConnectorError, ConnectorRegistry};
use atrium_engine::context::Context;
use atrium_engine::mcp::{McpClient, McpTool};
use atrium_engine::output::ChunkHandler;
use atrium_engine::runtime::{Runtime, RuntimeSettings};
use atrium_engine::sandbox::{ExecutionOptions, Executor, SandboxManager};
use atrium_engine::script::{HookScript, ScriptContext, ScriptEngine, ScriptScope};
use atrium_engine::search::{Request, ResultItem, SearchHandler};
use atrium_engine::store::{AssistantStore, MemoryStore};
use sdk::errors::EngineError;
use sdk::types::{CompletionResponse, Message, Role, StreamChunk};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runtime rooted at `app_root` with an in-memory store and the given
/// connectors registered; the first connector is the default
pub fn runtime(app_root: &Path, connectors: Vec<Arc<FakeConnector>>) -> Runtime {
    runtime_with_store(app_root, connectors).0
}

pub fn runtime_with_store(
    app_root: &Path,
    connectors: Vec<Arc<FakeConnector>>,
) -> (Runtime, Arc<MemoryStore>) {
    let settings = RuntimeSettings {
        app_root: app_root.to_path_buf(),
        default_connector: connectors.first().map(|c| c.id().to_string()),
        ..Default::default()
    };
    let registry = ConnectorRegistry::new();
    for connector in connectors {
        registry.register(connector as Arc<dyn Connector>);
    }
    let rt = Runtime::with_connectors(settings, registry);
    let store = Arc::new(MemoryStore::new());
    rt.set_store(Arc::clone(&store) as Arc<dyn AssistantStore>);
    rt.set_script_engine(Arc::new(FakeScriptEngine::new()));
    (rt, store)
}

pub fn record(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

type Reply = Box<dyn Fn(&[Message]) -> Result<String, String> + Send + Sync>;

/// Connector answering from a closure; the answer is streamed word by word
pub struct FakeConnector {
    id: String,
    model: String,
    reply: Reply,
    pub calls: Mutex<Vec<Vec<Message>>>,
    pub options: Mutex<Vec<Map<String, Value>>>,
}

impl FakeConnector {
    pub fn new(
        id: &str,
        model: &str,
        reply: impl Fn(&[Message]) -> Result<String, String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            model: model.to_string(),
            reply: Box::new(reply),
            calls: Mutex::new(Vec::new()),
            options: Mutex::new(Vec::new()),
        })
    }

    /// Always answers `text`
    pub fn fixed(id: &str, text: &str) -> Arc<Self> {
        let text = text.to_string();
        Self::new(id, "gpt-4o-mini", move |_| Ok(text.clone()))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Vec<Message> {
        self.calls.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn setting(&self) -> Map<String, Value> {
        let mut setting = Map::new();
        setting.insert("host".into(), Value::String("http://fake.local/v1".into()));
        setting.insert("key".into(), Value::String("sk-fake".into()));
        setting.insert("model".into(), Value::String(self.model.clone()));
        setting
    }

    fn is(&self, kind: &str) -> bool {
        kind == "openai"
    }

    async fn stream(
        &self,
        messages: &[Message],
        options: &Map<String, Value>,
        handler: ChunkHandler,
    ) -> Result<CompletionResponse, ConnectorError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.options.lock().unwrap().push(options.clone());

        let text = (self.reply)(messages).map_err(ConnectorError::Network)?;
        for word in text.split_inclusive(' ') {
            handler(&StreamChunk::text(word));
        }
        Ok(CompletionResponse {
            id: "cmpl-fake".to_string(),
            model: self.model.clone(),
            created: 0,
            role: Role::Assistant,
            content: text,
            finish_reason: Some("stop".to_string()),
        })
    }
}

/// Body of a fake script function
pub type ScriptFn =
    Arc<dyn Fn(&ScriptScope, &[Value]) -> Result<Value, EngineError> + Send + Sync>;

/// Script whose exports are Rust closures
#[derive(Clone)]
pub struct FakeScript {
    id: String,
    functions: HashMap<String, ScriptFn>,
    pub contexts: Arc<AtomicUsize>,
}

impl FakeScript {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            functions: HashMap::new(),
            contexts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with(
        mut self,
        name: &str,
        f: impl Fn(&ScriptScope, &[Value]) -> Result<Value, EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn context_count(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }
}

struct FakeContext {
    scope: ScriptScope,
    functions: HashMap<String, ScriptFn>,
}

impl HookScript for FakeScript {
    fn id(&self) -> &str {
        &self.id
    }

    fn fingerprint(&self) -> &str {
        "fake"
    }

    fn new_context(&self, scope: &ScriptScope) -> Result<Box<dyn ScriptContext>, EngineError> {
        self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            scope: scope.clone(),
            functions: self.functions.clone(),
        }))
    }
}

impl ScriptContext for FakeContext {
    fn has(&self, function: &str) -> bool {
        self.functions.contains_key(function)
    }

    fn call(&mut self, function: &str, args: &[Value]) -> Result<Value, EngineError> {
        let f = self
            .functions
            .get(function)
            .ok_or_else(|| EngineError::NotFound(format!("function {}", function)))?;
        f(&self.scope, args)
    }
}

/// Engine for `.wasm` sources in tests
///
/// A source registered with `with_script` compiles to that script; any other
/// source is read as a comma-separated list of exported functions that
/// return `null`.
#[derive(Default)]
pub struct FakeScriptEngine {
    scripts: Mutex<HashMap<String, FakeScript>>,
    pub compiled: Mutex<Vec<String>>,
}

impl FakeScriptEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, source: &str, script: FakeScript) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(source.to_string(), script);
        self
    }
}

impl ScriptEngine for FakeScriptEngine {
    fn extension(&self) -> &str {
        "wasm"
    }

    fn compile(
        &self,
        id: &str,
        _file: &str,
        source: &[u8],
    ) -> Result<Arc<dyn HookScript>, EngineError> {
        let text = String::from_utf8_lossy(source).trim().to_string();
        self.compiled.lock().unwrap().push(id.to_string());

        if let Some(script) = self.scripts.lock().unwrap().get(&text) {
            return Ok(Arc::new(script.clone()));
        }
        if text.starts_with('!') {
            return Err(EngineError::Parse(format!("cannot compile {}", id)));
        }

        let mut script = FakeScript::new(id);
        for name in text.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            script = script.with(name, |_, _| Ok(Value::Null));
        }
        Ok(Arc::new(script))
    }
}

/// MCP server with a fixed tool list
pub struct FakeMcp {
    tools: Vec<McpTool>,
    fail: bool,
}

impl FakeMcp {
    pub fn new(tools: Vec<McpTool>) -> Arc<Self> {
        Arc::new(Self { tools, fail: false })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            tools: Vec::new(),
            fail: true,
        })
    }
}

pub fn mcp_tool(name: &str, process: Option<&str>) -> McpTool {
    McpTool {
        name: name.to_string(),
        description: format!("{} tool", name),
        input_schema: serde_json::json!({ "type": "object" }),
        process: process.map(String::from),
    }
}

#[async_trait]
impl McpClient for FakeMcp {
    async fn list_tools(&self, filter: Option<&[String]>) -> Result<Vec<McpTool>, EngineError> {
        if self.fail {
            return Err(EngineError::Execution("mcp server down".to_string()));
        }
        Ok(self
            .tools
            .iter()
            .filter(|t| filter.map_or(true, |f| f.is_empty() || f.contains(&t.name)))
            .cloned()
            .collect())
    }
}

/// How a fake executor behaves
#[derive(Clone)]
pub enum SandboxBehavior {
    /// Stream these chunks, then answer their concatenation
    Reply(Vec<String>),
    /// Fail without output
    Fail(String),
    /// Never finish
    Hang,
}

/// Sandbox manager recording what it was asked to do
pub struct FakeSandbox {
    behavior: SandboxBehavior,
    create_error: Option<String>,
    pub created: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub options: Mutex<Vec<ExecutionOptions>>,
    pub loading_ids: Arc<Mutex<Vec<String>>>,
}

impl FakeSandbox {
    pub fn new(behavior: SandboxBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            create_error: None,
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            options: Mutex::new(Vec::new()),
            loading_ids: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Manager whose `create_executor` always fails
    pub fn refusing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            behavior: SandboxBehavior::Hang,
            create_error: Some(message.to_string()),
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
            options: Mutex::new(Vec::new()),
            loading_ids: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn last_options(&self) -> ExecutionOptions {
        self.options
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no executor created")
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Install as the runtime's manager
    pub fn install(self: &Arc<Self>, rt: &Runtime) {
        let manager = Arc::clone(self);
        rt.sandbox().set_factory(move || {
            let manager = Arc::clone(&manager);
            async move { Ok(manager as Arc<dyn SandboxManager>) }
        });
    }
}

#[async_trait]
impl SandboxManager for FakeSandbox {
    async fn create_executor(
        &self,
        options: ExecutionOptions,
    ) -> Result<Box<dyn Executor>, EngineError> {
        self.options.lock().unwrap().push(options);
        if let Some(message) = &self.create_error {
            return Err(EngineError::Execution(message.clone()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeExecutor {
            behavior: self.behavior.clone(),
            closed: Arc::clone(&self.closed),
            loading_ids: Arc::clone(&self.loading_ids),
        }))
    }
}

struct FakeExecutor {
    behavior: SandboxBehavior,
    closed: Arc<AtomicUsize>,
    loading_ids: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn stream(
        &self,
        _ctx: &Context,
        _messages: &[Message],
        handler: ChunkHandler,
    ) -> Result<CompletionResponse, EngineError> {
        match &self.behavior {
            SandboxBehavior::Reply(chunks) => {
                for chunk in chunks {
                    handler(&StreamChunk::text(chunk.as_str()));
                }
                Ok(CompletionResponse {
                    id: "sandbox".to_string(),
                    model: "claude-sonnet-4".to_string(),
                    role: Role::Assistant,
                    content: chunks.concat(),
                    ..Default::default()
                })
            }
            SandboxBehavior::Fail(message) => Err(EngineError::Execution(message.clone())),
            SandboxBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(EngineError::Execution("unreachable".to_string()))
            }
        }
    }

    fn set_loading_msg_id(&self, id: &str) {
        self.loading_ids.lock().unwrap().push(id.to_string());
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Search backend with canned results
pub struct FakeSearch {
    result: Result<Vec<ResultItem>, String>,
    delay: Duration,
    pub requests: Mutex<Vec<Request>>,
}

impl FakeSearch {
    pub fn new(items: Vec<ResultItem>) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(items),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Err(message.to_string()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn delayed(items: Vec<ResultItem>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(items),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl SearchHandler for FakeSearch {
    async fn search(&self, request: &Request) -> Result<Vec<ResultItem>, EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result
            .clone()
            .map_err(EngineError::Execution)
    }
}

/// Write `contents` at `relative` under `root`, creating parent directories
pub fn write_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Whether every status opened on `sink` was resolved exactly once
pub fn statuses_resolved(sink: &atrium_engine::output::BufferedOutput) -> bool {
    let messages = sink.messages();
    messages
        .iter()
        .filter(|m| m.kind == "loading" && !m.replace)
        .all(|opened| {
            messages
                .iter()
                .filter(|m| m.done && m.id == opened.id)
                .count()
                == 1
        })
}

/// Final status texts in order, with their failure flag
pub fn resolved_statuses(sink: &atrium_engine::output::BufferedOutput) -> Vec<(String, bool)> {
    sink.messages()
        .iter()
        .filter(|m| m.done)
        .map(|m| {
            (
                m.content().unwrap_or_default().to_string(),
                m.props.get("failed").and_then(Value::as_bool).unwrap_or(false),
            )
        })
        .collect()
}
