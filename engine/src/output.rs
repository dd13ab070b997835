//! Output sink for client-visible messages
//!
//! Every assistant call writes to an [`OutputSink`]: streamed text chunks,
//! and status messages ("searching...", "preparing sandbox...") that are
//! later replaced in place by a terminal status using the same message id.

use sdk::errors::EngineError;
use sdk::types::StreamChunk;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

/// Callback invoked for every intermediate chunk of a completion
pub type ChunkHandler = Arc<dyn Fn(&StreamChunk) + Send + Sync>;

/// A message sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputMessage {
    /// Message id; present on replacements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Message type: `text`, `loading`, `error`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    /// Replace the message with the same id instead of appending
    #[serde(default)]
    pub replace: bool,
    /// Terminal state for the message id
    #[serde(default)]
    pub done: bool,
}

impl OutputMessage {
    pub fn text(content: impl Into<String>) -> Self {
        let mut props = Map::new();
        props.insert("content".to_string(), Value::String(content.into()));
        Self {
            kind: "text".to_string(),
            props,
            ..Default::default()
        }
    }

    pub fn loading(message: impl Into<String>) -> Self {
        let mut props = Map::new();
        props.insert("message".to_string(), Value::String(message.into()));
        Self {
            kind: "loading".to_string(),
            props,
            ..Default::default()
        }
    }

    /// Text of a `text` message or status of a `loading` message
    pub fn content(&self) -> Option<&str> {
        self.props
            .get("content")
            .or_else(|| self.props.get("message"))
            .and_then(Value::as_str)
    }
}

/// Destination for client-visible output
pub trait OutputSink: Send + Sync {
    /// Send a message that may later be replaced; returns its id
    fn send_stream(&self, message: OutputMessage) -> Result<String, EngineError>;

    /// Send a message
    fn send(&self, message: OutputMessage) -> Result<(), EngineError>;
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl OutputSink for NullOutput {
    fn send_stream(&self, message: OutputMessage) -> Result<String, EngineError> {
        Ok(message
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
    }

    fn send(&self, _message: OutputMessage) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Sink that keeps every message in memory
#[derive(Debug, Default)]
pub struct BufferedOutput {
    messages: Mutex<Vec<OutputMessage>>,
}

impl BufferedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything sent so far
    pub fn messages(&self) -> Vec<OutputMessage> {
        self.messages
            .lock()
            .expect("BufferedOutput lock poisoned")
            .clone()
    }

    /// Concatenated text of all `text` messages
    pub fn text(&self) -> String {
        self.messages()
            .iter()
            .filter(|m| m.kind == "text")
            .filter_map(|m| m.content().map(String::from))
            .collect()
    }
}

impl OutputSink for BufferedOutput {
    fn send_stream(&self, mut message: OutputMessage) -> Result<String, EngineError> {
        let id = message
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        message.id = Some(id.clone());
        self.messages
            .lock()
            .expect("BufferedOutput lock poisoned")
            .push(message);
        Ok(id)
    }

    fn send(&self, message: OutputMessage) -> Result<(), EngineError> {
        self.messages
            .lock()
            .expect("BufferedOutput lock poisoned")
            .push(message);
        Ok(())
    }
}

/// Sink that prints text chunks to stdout and statuses to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleOutput;

impl OutputSink for ConsoleOutput {
    fn send_stream(&self, message: OutputMessage) -> Result<String, EngineError> {
        let id = message
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.send(message)?;
        Ok(id)
    }

    fn send(&self, message: OutputMessage) -> Result<(), EngineError> {
        use std::io::Write;

        match (message.kind.as_str(), message.content()) {
            ("text", Some(text)) => {
                let mut stdout = std::io::stdout();
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            (_, Some(status)) => eprintln!("[{}] {}", message.kind, status),
            _ => {}
        }
        Ok(())
    }
}

/// An open status message that must be resolved exactly once
///
/// Dropping an unresolved status replaces it with a failure status, so every
/// early return still leaves the client with a terminal message.
pub struct LoadingStatus {
    sink: Arc<dyn OutputSink>,
    id: Option<String>,
}

impl LoadingStatus {
    /// Send a loading message and keep its id
    pub fn open(sink: Arc<dyn OutputSink>, message: &str) -> Self {
        let id = match sink.send_stream(OutputMessage::loading(message)) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Failed to send loading message: {}", e);
                None
            }
        };
        Self { sink, id }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Update the status text without resolving it
    pub fn update(&self, message: &str) {
        if let Some(id) = &self.id {
            let mut msg = OutputMessage::loading(message);
            msg.id = Some(id.clone());
            msg.replace = true;
            if let Err(e) = self.sink.send(msg) {
                tracing::warn!("Failed to update loading message: {}", e);
            }
        }
    }

    /// Resolve with a success status
    pub fn done(mut self, message: &str) {
        self.resolve(message, false);
    }

    /// Resolve with a failure status
    pub fn fail(mut self, message: &str) {
        self.resolve(message, true);
    }

    fn resolve(&mut self, message: &str, failed: bool) {
        let Some(id) = self.id.take() else {
            return;
        };
        let mut msg = OutputMessage::loading(message);
        msg.id = Some(id);
        msg.replace = true;
        msg.done = true;
        msg.props.insert("failed".to_string(), json!(failed));
        if let Err(e) = self.sink.send(msg) {
            tracing::warn!("Failed to resolve loading message: {}", e);
        }
    }
}

impl Drop for LoadingStatus {
    fn drop(&mut self) {
        self.resolve("Interrupted", true);
    }
}
