//! Integration tests for the OpenAI-compatible connector against a mock server

use atrium_engine::connector::{Connector, ConnectorError, OpenAIConnector};
use atrium_engine::output::ChunkHandler;
use sdk::types::{Message, StreamChunk};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn collector() -> (ChunkHandler, Arc<Mutex<Vec<String>>>) {
    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&chunks);
    let handler: ChunkHandler = Arc::new(move |chunk: &StreamChunk| {
        sink.lock().unwrap().push(chunk.text.clone());
    });
    (handler, chunks)
}

fn connector(server: &MockServer, options: Map<String, Value>) -> OpenAIConnector {
    OpenAIConnector::new(
        "openai",
        format!("{}/v1/", server.uri()),
        "gpt-4o-mini",
        Some("sk-test".to_string()),
        options,
    )
}

#[tokio::test]
async fn test_streams_server_sent_events() {
    let server = MockServer::start().await;
    let body = [
        r#"data: {"id":"cmpl-1","model":"gpt-4o-mini-2024","created":1700000000,"choices":[{"delta":{"role":"assistant"}}]}"#,
        r#"data: {"id":"cmpl-1","choices":[{"delta":{"content":"Hel"}}]}"#,
        r#"data: {"id":"cmpl-1","choices":[{"delta":{"content":"lo"}}]}"#,
        r#"data: {"id":"cmpl-1","choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        "data: [DONE]",
        "",
    ]
    .join("\n\n");

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("Authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "temperature": 0.7,
            "max_tokens": 32,
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut defaults = Map::new();
    defaults.insert("temperature".into(), json!(0.2));
    let connector = connector(&server, defaults);

    let mut options = Map::new();
    options.insert("temperature".into(), json!(0.7));
    options.insert("max_tokens".into(), json!(32));
    let (handler, chunks) = collector();

    let completion = connector
        .stream(&[Message::user("hi")], &options, handler)
        .await
        .unwrap();

    assert_eq!(completion.id, "cmpl-1");
    assert_eq!(completion.model, "gpt-4o-mini-2024");
    assert_eq!(completion.created, 1700000000);
    assert_eq!(completion.content, "Hello");
    assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
    assert_eq!(*chunks.lock().unwrap(), vec!["Hel", "lo"]);
}

#[tokio::test]
async fn test_plain_json_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cmpl-2",
            "model": "gpt-4o-mini",
            "choices": [{
                "message": { "role": "assistant", "content": "Whole answer" },
                "finish_reason": "length"
            }]
        })))
        .mount(&server)
        .await;

    let (handler, chunks) = collector();
    let completion = connector(&server, Map::new())
        .stream(&[Message::user("hi")], &Map::new(), handler)
        .await
        .unwrap();

    assert_eq!(completion.id, "cmpl-2");
    assert_eq!(completion.content, "Whole answer");
    assert_eq!(completion.finish_reason.as_deref(), Some("length"));
    assert_eq!(*chunks.lock().unwrap(), vec!["Whole answer"]);
}

#[tokio::test]
async fn test_error_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "messages": [{ "content": "auth" }] })))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "messages": [{ "content": "busy" }] })))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({ "messages": [{ "content": "broken" }] })))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown model"))
        .mount(&server)
        .await;

    let connector = connector(&server, Map::new());
    let send = |text: &'static str| {
        let (handler, _) = collector();
        let connector = &connector;
        async move {
            connector
                .stream(&[Message::user(text)], &Map::new(), handler)
                .await
        }
    };

    assert!(matches!(
        send("auth").await,
        Err(ConnectorError::Authentication(body)) if body == "bad key"
    ));
    assert!(matches!(send("busy").await, Err(ConnectorError::RateLimited)));
    assert!(matches!(
        send("broken").await,
        Err(ConnectorError::InvalidRequest(body)) if body == "unknown model"
    ));
}

#[tokio::test]
async fn test_malformed_event_is_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/event-stream")
                .set_body_string("data: {not json}\n\n"),
        )
        .mount(&server)
        .await;

    let (handler, _) = collector();
    let result = connector(&server, Map::new())
        .stream(&[Message::user("hi")], &Map::new(), handler)
        .await;
    assert!(matches!(result, Err(ConnectorError::Parse(_))));
}

#[test]
fn test_setting_describes_the_connection() {
    let connector = OpenAIConnector::new(
        "openai",
        "https://api.example.com/v1/",
        "gpt-4o",
        Some("sk-live".to_string()),
        Map::new(),
    );
    let setting = connector.setting();

    assert_eq!(setting.get("type"), Some(&json!("openai")));
    assert_eq!(setting.get("host"), Some(&json!("https://api.example.com/v1")));
    assert_eq!(setting.get("model"), Some(&json!("gpt-4o")));
    assert_eq!(setting.get("key"), Some(&json!("sk-live")));
    assert!(connector.is("OpenAI"));
    assert!(!connector.is("anthropic"));
}
