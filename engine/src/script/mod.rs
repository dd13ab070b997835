//! Hook scripts
//!
//! Assistants may ship scripts that hook into the stream pipeline (`Create`,
//! `Next`) and secondary scripts exposed as named handlers. Scripts are
//! compiled once by a [`ScriptEngine`]; every invocation runs in a fresh
//! [`ScriptContext`] seeded with the caller's globals.

use sdk::errors::EngineError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

pub mod bridge;
pub mod wasm;

pub use bridge::{AgentCall, AgentCallHost, CallOptions, RetryOptions, ALLOWED_EVENTS};
pub use wasm::WasmScriptEngine;

/// Host services reachable from inside a running script
pub trait ScriptHost: Send + Sync {
    /// Run an assistant call described by `request`
    fn call_agent(&self, request: Value) -> Result<Value, EngineError>;
}

/// Everything a new script context is seeded with
#[derive(Clone, Default)]
pub struct ScriptScope {
    pub globals: Map<String, Value>,
    pub host: Option<Arc<dyn ScriptHost>>,
}

impl ScriptScope {
    pub fn new(globals: Map<String, Value>) -> Self {
        Self {
            globals,
            host: None,
        }
    }

    pub fn with_host(mut self, host: Arc<dyn ScriptHost>) -> Self {
        self.host = Some(host);
        self
    }
}

/// A compiled script
pub trait HookScript: Send + Sync {
    fn id(&self) -> &str;

    /// Content hash of the compiled source
    fn fingerprint(&self) -> &str;

    /// Create an isolated execution context
    fn new_context(&self, scope: &ScriptScope) -> Result<Box<dyn ScriptContext>, EngineError>;
}

/// One isolated execution of a script
pub trait ScriptContext: Send {
    /// Whether the script exports `function`
    fn has(&self, function: &str) -> bool;

    /// Call an exported function with JSON arguments
    fn call(&mut self, function: &str, args: &[Value]) -> Result<Value, EngineError>;
}

/// Compiles script sources
pub trait ScriptEngine: Send + Sync {
    /// File extension of script sources handled by this engine
    fn extension(&self) -> &str;

    fn compile(
        &self,
        id: &str,
        file: &str,
        source: &[u8],
    ) -> Result<Arc<dyn HookScript>, EngineError>;

    fn compile_file(&self, id: &str, path: &Path) -> Result<Arc<dyn HookScript>, EngineError> {
        let source = std::fs::read(path)?;
        self.compile(id, &path.to_string_lossy(), &source)
    }
}

/// Engine used when no script engine is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoScripts;

impl ScriptEngine for NoScripts {
    fn extension(&self) -> &str {
        "wasm"
    }

    fn compile(
        &self,
        id: &str,
        _file: &str,
        _source: &[u8],
    ) -> Result<Arc<dyn HookScript>, EngineError> {
        Err(EngineError::NotConfigured(format!(
            "no script engine available to compile '{}'",
            id
        )))
    }
}

/// Handler name for a secondary script of an assistant
pub fn handler_name(assistant_id: &str, script_id: &str) -> String {
    format!("agents.{}.{}", assistant_id, script_id).to_lowercase()
}

/// Process-wide table of named script handlers
///
/// Each registration carries the owner token of the assistant instance
/// that made it, so a stale instance cannot remove a newer one's handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Registration>>,
    next_owner: AtomicU64,
}

struct Registration {
    owner: u64,
    script: Arc<dyn HookScript>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh token identifying one assistant instance
    pub fn owner_token(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register `script` as `agents.<assistant_id>.<script_id>`
    pub fn register(
        &self,
        assistant_id: &str,
        script_id: &str,
        owner: u64,
        script: Arc<dyn HookScript>,
    ) {
        let name = handler_name(assistant_id, script_id);
        tracing::debug!("Registered script handler '{}'", name);
        self.handlers
            .write()
            .expect("HandlerRegistry lock poisoned")
            .insert(name, Registration { owner, script });
    }

    /// Remove the handlers `owner` registered for `assistant_id`
    ///
    /// Entries since replaced by another instance are left alone.
    pub fn unregister_assistant(&self, assistant_id: &str, owner: u64) -> usize {
        let prefix = format!("agents.{}.", assistant_id).to_lowercase();
        let mut handlers = self.handlers.write().expect("HandlerRegistry lock poisoned");
        let before = handlers.len();
        handlers.retain(|name, entry| !(entry.owner == owner && name.starts_with(&prefix)));
        let removed = before - handlers.len();
        if removed > 0 {
            tracing::debug!(
                "Unregistered {} script handler(s) for '{}'",
                removed,
                assistant_id
            );
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HookScript>> {
        self.handlers
            .read()
            .expect("HandlerRegistry lock poisoned")
            .get(&name.to_lowercase())
            .map(|entry| Arc::clone(&entry.script))
    }

    /// Call `function` of handler `name` in a fresh context
    pub fn call(
        &self,
        name: &str,
        function: &str,
        args: &[Value],
        scope: &ScriptScope,
    ) -> Result<Value, EngineError> {
        let script = self
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("script handler '{}'", name)))?;
        let mut ctx = script.new_context(scope)?;
        ctx.call(function, args)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .expect("HandlerRegistry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl HookScript for Noop {
        fn id(&self) -> &str {
            "noop"
        }

        fn fingerprint(&self) -> &str {
            ""
        }

        fn new_context(&self, _scope: &ScriptScope) -> Result<Box<dyn ScriptContext>, EngineError> {
            Err(EngineError::Execution("not runnable".into()))
        }
    }

    #[test]
    fn test_unregister_assistant_only_removes_its_handlers() {
        let registry = HandlerRegistry::new();
        let owner = registry.owner_token();
        registry.register("tests.Basic", "tools", owner, Arc::new(Noop));
        registry.register("tests.Basic", "render", owner, Arc::new(Noop));
        registry.register("tests.basic2", "tools", registry.owner_token(), Arc::new(Noop));

        assert!(registry.get("agents.tests.basic.tools").is_some());
        assert_eq!(registry.unregister_assistant("tests.basic", owner), 2);
        assert_eq!(registry.names(), vec!["agents.tests.basic2.tools".to_string()]);
    }

    #[test]
    fn test_stale_owner_keeps_replaced_handlers() {
        let registry = HandlerRegistry::new();
        let first = registry.owner_token();
        let second = registry.owner_token();
        assert_ne!(first, second);

        registry.register("tests.basic", "tools", first, Arc::new(Noop));
        registry.register("tests.basic", "render", first, Arc::new(Noop));
        registry.register("tests.basic", "tools", second, Arc::new(Noop));

        assert_eq!(registry.unregister_assistant("tests.basic", first), 1);
        assert_eq!(registry.names(), vec!["agents.tests.basic.tools".to_string()]);
        assert_eq!(registry.unregister_assistant("tests.basic", first), 0);
        assert_eq!(registry.unregister_assistant("tests.basic", second), 1);
        assert!(registry.names().is_empty());
    }
}
