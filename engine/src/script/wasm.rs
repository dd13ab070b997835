//! WASM hook scripts via Extism
//!
//! Each script is a WASM module exporting hook functions (`Create`, `Next`,
//! handler methods). Arguments are passed as a JSON array string and the
//! return value is read back as JSON. Context globals are exposed as Extism
//! config keys, one key per global holding its JSON encoding.
//!
//! Modules may import the host function `agent_call(request) -> reply` to
//! call other assistants; the reply is `{"data": ...}` or `{"error": "..."}`.

use super::{HookScript, ScriptContext, ScriptEngine, ScriptHost, ScriptScope};
use extism::{CurrentPlugin, Function, Manifest as ExtismManifest, Plugin, UserData, Val, ValType, Wasm};
use sdk::errors::EngineError;
use serde_json::{json, Value};
use std::sync::Arc;

/// Compiles WASM hook scripts
#[derive(Debug, Default, Clone, Copy)]
pub struct WasmScriptEngine;

impl WasmScriptEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for WasmScriptEngine {
    fn extension(&self) -> &str {
        "wasm"
    }

    fn compile(
        &self,
        id: &str,
        file: &str,
        source: &[u8],
    ) -> Result<Arc<dyn HookScript>, EngineError> {
        let script = WasmHookScript {
            id: id.to_string(),
            file: file.to_string(),
            wasm: source.to_vec(),
            fingerprint: blake3::hash(source).to_hex().to_string(),
        };

        // Instantiate once so broken modules fail at load time
        script.instantiate(&ScriptScope::default()).map_err(|e| {
            tracing::error!("Failed to compile script '{}' ({}): {}", id, file, e);
            EngineError::Parse(format!("script {}: {}", file, e))
        })?;

        tracing::debug!("Compiled script '{}' from {}", id, file);
        Ok(Arc::new(script))
    }
}

struct WasmHookScript {
    id: String,
    file: String,
    wasm: Vec<u8>,
    fingerprint: String,
}

impl WasmHookScript {
    fn instantiate(&self, scope: &ScriptScope) -> Result<Plugin, extism::Error> {
        let mut manifest = ExtismManifest::new([Wasm::data(self.wasm.clone())]);
        for (key, value) in &scope.globals {
            manifest = manifest.with_config_key(key.as_str(), value.to_string());
        }

        let functions = vec![agent_call_function(scope.host.clone())];
        Plugin::new(&manifest, functions, true)
    }
}

impl HookScript for WasmHookScript {
    fn id(&self) -> &str {
        &self.id
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn new_context(&self, scope: &ScriptScope) -> Result<Box<dyn ScriptContext>, EngineError> {
        let plugin = self.instantiate(scope).map_err(|e| {
            EngineError::Execution(format!("failed to instantiate {}: {}", self.file, e))
        })?;
        Ok(Box::new(WasmContext {
            script_id: self.id.clone(),
            plugin,
        }))
    }
}

struct WasmContext {
    script_id: String,
    plugin: Plugin,
}

impl ScriptContext for WasmContext {
    fn has(&self, function: &str) -> bool {
        self.plugin.function_exists(function)
    }

    fn call(&mut self, function: &str, args: &[Value]) -> Result<Value, EngineError> {
        let input = serde_json::to_string(args)?;
        let output = self
            .plugin
            .call::<&str, String>(function, &input)
            .map_err(|e| {
                tracing::error!(
                    "Script '{}' function '{}' failed: {}",
                    self.script_id,
                    function,
                    e
                );
                EngineError::Execution(format!("{}.{}: {}", self.script_id, function, e))
            })?;

        if output.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&output).map_err(|e| {
            EngineError::Parse(format!(
                "{}.{} returned invalid JSON: {}",
                self.script_id, function, e
            ))
        })
    }
}

struct HostSlot {
    host: Option<Arc<dyn ScriptHost>>,
}

fn agent_call_function(host: Option<Arc<dyn ScriptHost>>) -> Function {
    Function::new(
        "agent_call",
        [ValType::I64],
        [ValType::I64],
        UserData::new(HostSlot { host }),
        |plugin: &mut CurrentPlugin,
         inputs: &[Val],
         outputs: &mut [Val],
         user_data: UserData<HostSlot>| {
            let request: String = plugin.memory_get_val(&inputs[0])?;
            let host = {
                let slot = user_data.get()?;
                let slot = slot
                    .lock()
                    .map_err(|_| extism::Error::msg("agent_call host lock poisoned"))?;
                slot.host.clone()
            };

            let reply = match host {
                Some(host) => match serde_json::from_str::<Value>(&request)
                    .map_err(EngineError::from)
                    .and_then(|req| host.call_agent(req))
                {
                    Ok(data) => json!({ "data": data }),
                    Err(e) => json!({ "error": e.to_string() }),
                },
                None => json!({ "error": "agent calls are not available in this context" }),
            };

            plugin.memory_set_val(&mut outputs[0], reply.to_string())?;
            Ok(())
        },
    )
}
