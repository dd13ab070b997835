//! Per-call context
//!
//! A [`Context`] travels with one assistant invocation: who is calling,
//! which chat it belongs to, where output goes, and whether the call has
//! been cancelled. Contexts are cheap to clone; derived calls (search
//! intent checks, script-initiated calls) clone and adjust them.

use crate::output::{NullOutput, OutputSink};
use crate::trace::Tracer;
use sdk::types::{Skip, Uses};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;

/// Origin of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Referer {
    #[default]
    Api,
    Script,
    Agent,
    Process,
}

impl Referer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Referer::Api => "api",
            Referer::Script => "script",
            Referer::Agent => "agent",
            Referer::Process => "process",
        }
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Authorized {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

/// Cancellation flag shared by a context and its clones
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancelSignal {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `changed` only errors after drop.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Per-call options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Options {
    #[serde(default)]
    pub skip: Skip,
    /// Connector override for this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,
    /// Capability overrides for this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<Uses>,
    /// Extra model options
    #[serde(default)]
    pub llm_options: Map<String, Value>,
}

/// Ambient state of one call
#[derive(Clone)]
pub struct Context {
    pub request_id: String,
    pub chat_id: String,
    pub assistant_id: String,
    pub locale: String,
    pub authorized: Option<Authorized>,
    pub referer: Referer,
    /// Suppress client-visible status messages
    pub silent: bool,
    /// Positional arguments from a script-initiated call
    pub args: Vec<Value>,
    pub output: Arc<dyn OutputSink>,
    pub tracer: Option<Arc<dyn Tracer>>,
    pub cancel: CancelSignal,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("chat_id", &self.chat_id)
            .field("assistant_id", &self.assistant_id)
            .field("referer", &self.referer)
            .field("silent", &self.silent)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create a new context for `chat_id` with output discarded
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            assistant_id: String::new(),
            locale: "en-us".to_string(),
            authorized: None,
            referer: Referer::Api,
            silent: false,
            args: Vec::new(),
            output: Arc::new(NullOutput),
            tracer: None,
            cancel: CancelSignal::default(),
        }
    }

    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = output;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.authorized = Some(Authorized {
            user_id: user_id.into(),
            team_id: None,
        });
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.authorized
            .as_ref()
            .map(|a| a.user_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Values exposed to hook scripts as globals
    pub fn script_globals(&self) -> Map<String, Value> {
        let mut globals = Map::new();
        globals.insert("chat_id".into(), Value::String(self.chat_id.clone()));
        globals.insert(
            "assistant_id".into(),
            Value::String(self.assistant_id.clone()),
        );
        globals.insert("locale".into(), Value::String(self.locale.clone()));
        globals.insert(
            "referer".into(),
            Value::String(self.referer.as_str().to_string()),
        );
        if let Some(user) = self.user_id() {
            globals.insert("user_id".into(), Value::String(user.to_string()));
        }
        globals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_signal_shared_by_clones() {
        let ctx = Context::new("chat-1");
        let derived = ctx.clone();

        let waiter = tokio::spawn(async move { derived.cancel.cancelled().await });
        ctx.cancel.cancel();

        waiter.await.unwrap();
        assert!(ctx.cancel.is_cancelled());
    }
}
