//! Integration tests for sandboxed execution
//!
//! The container manager is replaced by an in-process fake that records the
//! execution options and counts executor lifecycles.

mod common;

use atrium_engine::context::{Context, Options};
use atrium_engine::output::{BufferedOutput, OutputSink};
use atrium_engine::runtime::Runtime;
use atrium_engine::sandbox::SandboxManager;
use common::{
    mcp_tool, resolved_statuses, runtime, statuses_resolved, write_file, FakeConnector, FakeMcp,
    FakeSandbox, SandboxBehavior,
};
use sdk::errors::EngineError;
use sdk::types::Message;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn coder(root: &std::path::Path, timeout: &str) {
    write_file(
        root,
        "assistants/coder/package.toml",
        &format!(
            r#"
name = "Coder"
connector = "fake"

[sandbox]
command = "claude"
timeout = "{}"

[sandbox.arguments]
max_turns = 4

[sandbox.secrets]
GITHUB_TOKEN = "$ENV.ATRIUM_SANDBOX_TEST_TOKEN"
STATIC = "literal"
EMPTY = "$ENV.ATRIUM_SANDBOX_TEST_UNSET"

[mcp]
servers = ["echo", "down", "ghost"]
"#,
            timeout
        ),
    );
    write_file(
        root,
        "assistants/coder/prompts.toml",
        "[[prompts]]\nrole = \"system\"\ncontent = \"You write code.\"\n",
    );
    std::fs::create_dir_all(root.join("assistants/coder/skills")).unwrap();
}

fn setup(
    timeout: &str,
    behavior: SandboxBehavior,
) -> (TempDir, Runtime, Arc<FakeConnector>, Arc<FakeSandbox>) {
    let dir = TempDir::new().unwrap();
    coder(dir.path(), timeout);
    let connector = FakeConnector::fixed("fake", "should not be called");
    let rt = runtime(dir.path(), vec![Arc::clone(&connector)]);
    rt.mcp().register(
        "echo",
        FakeMcp::new(vec![mcp_tool("ping", Some("scripts.echo.ping")), mcp_tool("pong", None)]),
    );
    rt.mcp().register("down", FakeMcp::failing());
    let sandbox = FakeSandbox::new(behavior);
    sandbox.install(&rt);
    (dir, rt, connector, sandbox)
}

fn buffered_context(chat_id: &str) -> (Context, Arc<BufferedOutput>) {
    let sink = Arc::new(BufferedOutput::new());
    let ctx = Context::new(chat_id).with_output(Arc::clone(&sink) as Arc<dyn OutputSink>);
    (ctx, sink)
}

#[tokio::test]
async fn test_sandbox_stream_success() {
    std::env::set_var("ATRIUM_SANDBOX_TEST_TOKEN", "ghp_test");
    let (_dir, rt, connector, sandbox) = setup(
        "2s",
        SandboxBehavior::Reply(vec!["Hello ".to_string(), "world".to_string()]),
    );
    let (ctx, sink) = buffered_context("chat-1");
    let ctx = ctx.with_user("alice");
    let assistant = rt.load_from_path("/assistants/coder").unwrap();

    let response = assistant
        .stream(&rt, &ctx, vec![Message::user("fix the build")], Options::default())
        .await
        .unwrap();

    assert_eq!(
        response.completion.map(|c| c.content),
        Some("Hello world".to_string())
    );
    assert_eq!(sink.text(), "Hello world");
    assert_eq!(connector.call_count(), 0);
    assert_eq!(sandbox.created.load(Ordering::SeqCst), 1);
    assert_eq!(sandbox.closed_count(), 1);

    let opened: Vec<String> = sink
        .messages()
        .iter()
        .filter(|m| m.kind == "loading" && !m.replace)
        .filter_map(|m| m.id.clone())
        .collect();
    assert_eq!(*sandbox.loading_ids.lock().unwrap(), opened);
    assert!(statuses_resolved(&sink));
    assert!(resolved_statuses(&sink).contains(&("Sandbox ready".to_string(), false)));

    let options = sandbox.last_options();
    assert_eq!(options.command, "claude");
    assert_eq!(options.timeout, Duration::from_secs(2));
    assert_eq!(options.user_id, "alice");
    assert_eq!(options.chat_id, "chat-1");
    assert_eq!(options.system_prompt, "You write code.");
    assert_eq!(options.connector_host, "http://fake.local/v1");
    assert_eq!(options.connector_key, "sk-fake");
    assert_eq!(options.model, "gpt-4o-mini");
    assert_eq!(options.arguments.get("max_turns"), Some(&json!(4)));
    assert!(options
        .skills_dir
        .as_ref()
        .is_some_and(|d| d.ends_with("assistants/coder/skills")));

    assert_eq!(options.secrets.get("GITHUB_TOKEN").map(String::as_str), Some("ghp_test"));
    assert_eq!(options.secrets.get("STATIC").map(String::as_str), Some("literal"));
    assert!(!options.secrets.contains_key("EMPTY"));

    let tools: Vec<&String> = options.mcp_tools.keys().collect();
    assert_eq!(tools, vec!["echo__ping"]);
    assert_eq!(options.mcp_tools["echo__ping"].process, "scripts.echo.ping");

    let manifest = serde_json::to_value(options.mcp_config.unwrap()).unwrap();
    assert_eq!(
        manifest,
        json!({ "mcpServers": { "yao": { "command": "yao-bridge", "args": ["/tmp/yao.sock"] } } })
    );
}

#[tokio::test]
async fn test_anonymous_user() {
    let (_dir, rt, _connector, sandbox) =
        setup("2s", SandboxBehavior::Reply(vec!["ok".to_string()]));
    let assistant = rt.load_from_path("/assistants/coder").unwrap();

    assistant
        .stream(&rt, &Context::new("chat-2"), vec![Message::user("hi")], Options::default())
        .await
        .unwrap();

    assert_eq!(sandbox.last_options().user_id, "anonymous");
}

#[tokio::test]
async fn test_sandbox_failure_closes_executor() {
    let (_dir, rt, _connector, sandbox) = setup("2s", SandboxBehavior::Fail("boom".to_string()));
    let (ctx, sink) = buffered_context("chat-1");
    let assistant = rt.load_from_path("/assistants/coder").unwrap();

    let result = assistant
        .stream(&rt, &ctx, vec![Message::user("hi")], Options::default())
        .await;

    assert!(matches!(result, Err(EngineError::Execution(ref e)) if e.contains("boom")));
    assert_eq!(sandbox.closed_count(), 1);
    assert!(statuses_resolved(&sink));
    assert!(resolved_statuses(&sink).contains(&("Sandbox execution failed".to_string(), true)));
}

#[tokio::test]
async fn test_sandbox_timeout_closes_executor() {
    let (_dir, rt, _connector, sandbox) = setup("200ms", SandboxBehavior::Hang);
    let (ctx, sink) = buffered_context("chat-1");
    let assistant = rt.load_from_path("/assistants/coder").unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        assistant.stream(&rt, &ctx, vec![Message::user("hi")], Options::default()),
    )
    .await
    .expect("sandbox timeout not enforced");

    assert!(matches!(result, Err(EngineError::Execution(ref e)) if e.contains("timed out")));
    assert_eq!(sandbox.closed_count(), 1);
    assert!(statuses_resolved(&sink));
}

#[tokio::test]
async fn test_sandbox_cancel_closes_executor() {
    let (_dir, rt, _connector, sandbox) = setup("10m", SandboxBehavior::Hang);
    let (ctx, sink) = buffered_context("chat-1");
    let assistant = rt.load_from_path("/assistants/coder").unwrap();

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = assistant
        .stream(&rt, &ctx, vec![Message::user("hi")], Options::default())
        .await;

    assert!(matches!(result, Err(EngineError::Execution(ref e)) if e.contains("cancelled")));
    assert_eq!(sandbox.closed_count(), 1);
    assert!(statuses_resolved(&sink));
}

#[tokio::test]
async fn test_dropped_stream_still_closes_executor() {
    let (_dir, rt, _connector, sandbox) = setup("10m", SandboxBehavior::Hang);
    let (ctx, _sink) = buffered_context("chat-1");
    let assistant = rt.load_from_path("/assistants/coder").unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        assistant.stream(&rt, &ctx, vec![Message::user("hi")], Options::default()),
    )
    .await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sandbox.created.load(Ordering::SeqCst), 1);
    assert_eq!(sandbox.closed_count(), 1);
}

#[tokio::test]
async fn test_out_of_range_timeout_is_config_error() {
    for timeout in ["99999999999999999999999s", "-5s", "soon"] {
        let (_dir, rt, _connector, sandbox) =
            setup(timeout, SandboxBehavior::Reply(vec!["ok".to_string()]));
        let (ctx, sink) = buffered_context("chat-1");
        let assistant = rt.load_from_path("/assistants/coder").unwrap();

        let result = assistant
            .stream(&rt, &ctx, vec![Message::user("hi")], Options::default())
            .await;

        assert!(
            matches!(result, Err(EngineError::Config(_))),
            "timeout '{}' was accepted",
            timeout
        );
        assert_eq!(sandbox.created.load(Ordering::SeqCst), 0);
        assert_eq!(
            resolved_statuses(&sink),
            vec![("Invalid sandbox configuration".to_string(), true)]
        );
    }
}

#[tokio::test]
async fn test_executor_creation_failure() {
    let dir = TempDir::new().unwrap();
    coder(dir.path(), "2s");
    let rt = runtime(dir.path(), vec![FakeConnector::fixed("fake", "ok")]);
    let sandbox = FakeSandbox::refusing("no docker");
    sandbox.install(&rt);

    let (ctx, sink) = buffered_context("chat-1");
    let assistant = rt.load_from_path("/assistants/coder").unwrap();
    let result = assistant
        .stream(&rt, &ctx, vec![Message::user("hi")], Options::default())
        .await;

    assert!(result.is_err());
    assert_eq!(sandbox.closed_count(), 0);
    assert!(statuses_resolved(&sink));
    assert_eq!(
        resolved_statuses(&sink),
        vec![("Failed to start sandbox".to_string(), true)]
    );
}

#[tokio::test]
async fn test_missing_manager_is_not_configured() {
    let dir = TempDir::new().unwrap();
    coder(dir.path(), "2s");
    let rt = runtime(dir.path(), vec![FakeConnector::fixed("fake", "ok")]);

    let (ctx, sink) = buffered_context("chat-1");
    let assistant = rt.load_from_path("/assistants/coder").unwrap();
    let result = assistant
        .stream(&rt, &ctx, vec![Message::user("hi")], Options::default())
        .await;

    assert!(matches!(result, Err(EngineError::NotConfigured(_))));
    assert_eq!(
        resolved_statuses(&sink),
        vec![("Sandbox unavailable".to_string(), true)]
    );
}

#[tokio::test]
async fn test_empty_chat_id_is_config_error() {
    let (_dir, rt, _connector, sandbox) =
        setup("2s", SandboxBehavior::Reply(vec!["ok".to_string()]));
    let (ctx, sink) = buffered_context("");
    let assistant = rt.load_from_path("/assistants/coder").unwrap();

    let result = assistant
        .stream(&rt, &ctx, vec![Message::user("hi")], Options::default())
        .await;

    assert!(matches!(result, Err(EngineError::Config(_))));
    assert_eq!(sandbox.created.load(Ordering::SeqCst), 0);
    assert!(statuses_resolved(&sink));
}

#[tokio::test]
async fn test_silent_context_sends_no_status() {
    let (_dir, rt, _connector, sandbox) =
        setup("2s", SandboxBehavior::Reply(vec!["quiet".to_string()]));
    let (mut ctx, sink) = buffered_context("chat-1");
    ctx.silent = true;
    let assistant = rt.load_from_path("/assistants/coder").unwrap();

    assistant
        .stream(&rt, &ctx, vec![Message::user("hi")], Options::default())
        .await
        .unwrap();

    assert!(sink.messages().iter().all(|m| m.kind == "text"));
    assert!(sandbox.loading_ids.lock().unwrap().is_empty());
    assert_eq!(sandbox.closed_count(), 1);
}

#[tokio::test]
async fn test_manager_created_once() {
    let dir = TempDir::new().unwrap();
    coder(dir.path(), "2s");
    let rt = runtime(dir.path(), vec![FakeConnector::fixed("fake", "ok")]);
    let sandbox = FakeSandbox::new(SandboxBehavior::Reply(vec!["ok".to_string()]));
    let builds = Arc::new(AtomicUsize::new(0));

    let manager = Arc::clone(&sandbox);
    let counter = Arc::clone(&builds);
    rt.sandbox().set_factory(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let manager = Arc::clone(&manager);
        async move { Ok(manager as Arc<dyn SandboxManager>) }
    });

    let assistant = rt.load_from_path("/assistants/coder").unwrap();
    for chat in ["chat-1", "chat-2", "chat-3"] {
        assistant
            .stream(&rt, &Context::new(chat), vec![Message::user("hi")], Options::default())
            .await
            .unwrap();
    }

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(sandbox.created.load(Ordering::SeqCst), 3);
    assert_eq!(sandbox.closed_count(), 3);
}
