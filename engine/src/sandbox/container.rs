//! Container-backed sandbox
//!
//! Runs the CLI agent with `<runtime> run --rm -i`. The conversation is
//! written to stdin as one JSON document; stdout is read line by line.
//! Lines in the agent's `stream-json` format are decoded, anything else is
//! forwarded as plain text.
//!
//! Arguments are passed to the container CLI directly (no shell), and every
//! user-controlled value is rejected if it carries shell metacharacters.

use super::{ExecutionOptions, Executor, SandboxManager};
use crate::config::SandboxSettings;
use crate::context::Context;
use crate::output::{ChunkHandler, OutputMessage};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{CompletionResponse, Message, Role, StreamChunk};
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Manager that talks to a docker-compatible CLI
pub struct ContainerManager {
    settings: SandboxSettings,
}

impl ContainerManager {
    /// Verify the container runtime answers, then build the manager
    pub async fn connect(settings: SandboxSettings) -> Result<Self, EngineError> {
        let output = Command::new(&settings.runtime)
            .arg("version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                EngineError::NotConfigured(format!(
                    "container runtime '{}' not found: {}",
                    settings.runtime, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::NotConfigured(format!(
                "container runtime '{}' is not reachable: {}",
                settings.runtime,
                stderr.trim()
            )));
        }

        tracing::info!("Container runtime '{}' reachable", settings.runtime);
        Ok(Self { settings })
    }
}

#[async_trait]
impl SandboxManager for ContainerManager {
    async fn create_executor(
        &self,
        options: ExecutionOptions,
    ) -> Result<Box<dyn Executor>, EngineError> {
        let executor = ContainerExecutor::new(self.settings.runtime.clone(), options)?;
        tracing::debug!("Created sandbox executor '{}'", executor.container_name);
        Ok(Box::new(executor))
    }
}

/// One container run
pub struct ContainerExecutor {
    runtime: String,
    container_name: String,
    options: ExecutionOptions,
    loading_msg_id: Mutex<Option<String>>,
}

impl ContainerExecutor {
    pub fn new(runtime: String, options: ExecutionOptions) -> Result<Self, EngineError> {
        for value in [&options.command, &options.image, &options.chat_id, &options.user_id] {
            if has_shell_metacharacters(value) {
                return Err(EngineError::Validation(format!(
                    "shell metacharacters in sandbox option: {}",
                    value
                )));
            }
        }

        let container_name = container_name(&options.user_id, &options.chat_id);
        Ok(Self {
            runtime,
            container_name,
            options,
            loading_msg_id: Mutex::new(None),
        })
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Arguments for `<runtime> run`
    pub fn run_args(&self) -> Result<Vec<String>, EngineError> {
        let opts = &self.options;
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
            "--workdir".to_string(),
            opts.workdir.clone(),
        ];

        if let Some(memory) = &opts.max_memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(cpus) = opts.max_cpu {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(skills) = &opts.skills_dir {
            args.push("-v".to_string());
            args.push(format!("{}:{}/.skills:ro", skills.display(), opts.workdir));
        }

        // Values come from the process env, only names appear on the command line
        for name in self.env().iter().map(|(name, _)| name) {
            args.push("-e".to_string());
            args.push(name.clone());
        }

        args.push(opts.image.clone());
        args.push(opts.command.clone());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());

        if let Some(manifest) = &opts.mcp_config {
            let bytes = manifest.to_json_bytes()?;
            args.push("--mcp-config".to_string());
            args.push(String::from_utf8_lossy(&bytes).into_owned());
        }

        for (key, value) in &opts.arguments {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if has_shell_metacharacters(key) || has_shell_metacharacters(&value) {
                return Err(EngineError::Validation(format!(
                    "shell metacharacters in sandbox argument '{}'",
                    key
                )));
            }
            args.push(format!("--{}", key));
            args.push(value);
        }

        Ok(args)
    }

    /// Environment passed into the container
    fn env(&self) -> Vec<(String, String)> {
        let opts = &self.options;
        let mut env = Vec::new();
        if !opts.connector_host.is_empty() {
            env.push(("ANTHROPIC_BASE_URL".to_string(), opts.connector_host.clone()));
        }
        if !opts.connector_key.is_empty() {
            env.push(("ANTHROPIC_API_KEY".to_string(), opts.connector_key.clone()));
        }
        if !opts.model.is_empty() {
            env.push(("ANTHROPIC_MODEL".to_string(), opts.model.clone()));
        }
        for (name, value) in &opts.secrets {
            env.push((name.clone(), value.clone()));
        }
        env
    }

    /// Nothing to run: no prompt, no skills, no tools
    fn should_skip(&self) -> bool {
        self.options.system_prompt.is_empty()
            && self.options.skills_dir.is_none()
            && self.options.mcp_config.is_none()
    }

    fn report_running(&self, ctx: &Context) {
        let id = self
            .loading_msg_id
            .lock()
            .expect("executor lock poisoned")
            .clone();
        if let Some(id) = id {
            let mut msg = OutputMessage::loading(format!("Running {}", self.options.command));
            msg.id = Some(id);
            msg.replace = true;
            if let Err(e) = ctx.output.send(msg) {
                tracing::debug!("Failed to update sandbox status: {}", e);
            }
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn stream(
        &self,
        ctx: &Context,
        messages: &[Message],
        handler: ChunkHandler,
    ) -> Result<CompletionResponse, EngineError> {
        if self.should_skip() {
            tracing::debug!("Sandbox '{}' has nothing to run", self.container_name);
            return Ok(CompletionResponse {
                id: format!("sandbox-skip-{}", uuid::Uuid::new_v4()),
                model: "sandbox".to_string(),
                created: chrono::Utc::now().timestamp(),
                role: Role::Assistant,
                content: String::new(),
                finish_reason: Some("stop".to_string()),
            });
        }

        let args = self.run_args()?;
        let mut child = Command::new(&self.runtime)
            .args(&args)
            .envs(self.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Execution(format!("failed to start sandbox: {}", e)))?;

        self.report_running(ctx);

        let input = json!({
            "system_prompt": self.options.system_prompt,
            "messages": messages,
        });
        if let Some(mut stdin) = child.stdin.take() {
            let mut payload = serde_json::to_vec(&input)?;
            payload.push(b'\n');
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Execution("sandbox stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut parsed = StreamState::default();

        while let Some(line) = lines.next_line().await? {
            if let Some(chunk) = parsed.apply_line(&line) {
                handler(&chunk);
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(EngineError::Execution(format!(
                "sandbox '{}' exited with {}",
                self.container_name, status
            )));
        }

        Ok(parsed.into_response(&self.container_name, &self.options.model))
    }

    fn set_loading_msg_id(&self, id: &str) {
        *self.loading_msg_id.lock().expect("executor lock poisoned") = Some(id.to_string());
    }

    async fn close(&self) -> Result<(), EngineError> {
        let output = Command::new(&self.runtime)
            .args(["rm", "-f", &self.container_name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        tracing::debug!("Removed container '{}' ({})", self.container_name, output);
        Ok(())
    }
}

/// Accumulates the agent's output
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    text: String,
    model: Option<String>,
    result: Option<String>,
}

impl StreamState {
    /// Decode one stdout line; returns the chunk to forward, if any
    pub(crate) fn apply_line(&mut self, line: &str) -> Option<StreamChunk> {
        if line.trim().is_empty() {
            return None;
        }

        let Ok(event) = serde_json::from_str::<Value>(line) else {
            let text = format!("{}\n", line);
            self.text.push_str(&text);
            return Some(StreamChunk::text(text));
        };

        match event.get("type").and_then(Value::as_str) {
            Some("system") => {
                if let Some(model) = event.get("model").and_then(Value::as_str) {
                    self.model = Some(model.to_string());
                }
                None
            }
            Some("assistant") => {
                let text: String = event
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .map(|parts| {
                        parts
                            .iter()
                            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                            .filter_map(|p| p.get("text").and_then(Value::as_str))
                            .collect()
                    })
                    .unwrap_or_default();
                if text.is_empty() {
                    return None;
                }
                self.text.push_str(&text);
                Some(StreamChunk::text(text))
            }
            Some("result") => {
                self.result = event
                    .get("result")
                    .and_then(Value::as_str)
                    .map(String::from);
                None
            }
            _ => None,
        }
    }

    pub(crate) fn into_response(self, id: &str, model: &str) -> CompletionResponse {
        let content = match self.result {
            Some(result) if self.text.is_empty() => result,
            _ => self.text,
        };
        CompletionResponse {
            id: id.to_string(),
            model: self.model.unwrap_or_else(|| model.to_string()),
            created: chrono::Utc::now().timestamp(),
            role: Role::Assistant,
            content,
            finish_reason: Some("stop".to_string()),
        }
    }
}

fn container_name(user_id: &str, chat_id: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect()
    };
    format!("atrium-{}-{}", sanitize(user_id), sanitize(chat_id))
}

/// Detects: | & ; ' " ` \n < > $
fn has_shell_metacharacters(s: &str) -> bool {
    s.chars()
        .any(|c| matches!(c, '|' | '&' | ';' | '\'' | '"' | '`' | '\n' | '<' | '>' | '$'))
}
