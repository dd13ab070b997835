//! Command handlers for CLI operations
//!
//! - list: List assistants from the store
//! - show: Show one assistant definition
//! - chat: Run one turn against an assistant
//! - config show: Print the effective configuration

use anyhow::{Context as _, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::context::{Context, Options};
use crate::db::Database;
use crate::output::{ConsoleOutput, NullOutput, OutputSink};
use crate::runtime::Runtime;
use crate::store::AssistantFilter;
use sdk::errors::EngineErrorExt;
use sdk::types::{Message, Skip};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Build the runtime, open the database and load the built-in assistants
pub async fn bootstrap(config: &Config) -> Result<(Runtime, Database)> {
    let rt = Runtime::from_config(config);

    let db_path = get_db_path(config);
    let database = rt
        .attach_sqlite(&db_path)
        .await
        .context("Failed to open database")?;

    let ids = rt
        .load_built_in()
        .await
        .context("Failed to load built-in assistants")?;
    tracing::debug!("Built-in assistants: {:?}", ids);

    Ok((rt, database))
}

/// List assistants
pub async fn handle_list(tag: Option<String>, config: &Config, format: OutputFormat) -> Result<()> {
    let (rt, database) = bootstrap(config).await?;
    let store = rt
        .store()
        .ok_or_else(|| anyhow::anyhow!("No assistant store configured"))?;

    let filter = AssistantFilter {
        tags: tag.into_iter().collect(),
        ..Default::default()
    };
    let mut records = store
        .get_assistants(&filter)
        .await
        .context("Failed to list assistants")?;
    records.sort_by_key(|r| r.get("sort").and_then(|v| v.as_i64()).unwrap_or(i64::MAX));

    match format {
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No assistants found");
            }
            for record in &records {
                let id = record.get("assistant_id").and_then(|v| v.as_str()).unwrap_or("");
                let name = record.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let built_in = record
                    .get("built_in")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                println!(
                    "{:<32} {}{}",
                    id,
                    name,
                    if built_in { " (built-in)" } else { "" }
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "assistants": records,
                "count": records.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    database.close().await?;
    Ok(())
}

/// Show one assistant
pub async fn handle_show(id: String, config: &Config, format: OutputFormat) -> Result<()> {
    let (rt, database) = bootstrap(config).await?;
    let assistant = rt
        .get(&id)
        .await
        .with_context(|| format!("Failed to load assistant '{}'", id))?;

    match format {
        OutputFormat::Text => {
            let def = &assistant.definition;
            println!("Assistant: {}", def.id);
            println!("  Name: {}", def.name);
            println!(
                "  Connector: {}",
                if def.connector.is_empty() {
                    "(none)"
                } else {
                    &def.connector
                }
            );
            if let Some(description) = &def.description {
                println!("  Description: {}", description);
            }
            if !def.tags.is_empty() {
                println!("  Tags: {}", def.tags.join(", "));
            }
            println!("  Prompts: {}", def.prompts.len());
            println!("  Vision: {}", assistant.vision);
            println!("  Sandbox: {}", def.sandbox.is_some());
            if !assistant.scripts.is_empty() {
                let scripts: Vec<&str> = assistant.scripts.keys().map(String::as_str).collect();
                println!("  Scripts: {}", scripts.join(", "));
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&assistant.to_map())?);
        }
    }

    database.close().await?;
    Ok(())
}

/// Send one message to an assistant
///
/// In text mode the answer streams to stdout and statuses go to stderr.
pub async fn handle_chat(
    id: String,
    message: String,
    chat_id: Option<String>,
    no_search: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let (rt, database) = bootstrap(config).await?;
    let assistant = rt
        .get(&id)
        .await
        .with_context(|| format!("Failed to load assistant '{}'", id))?;

    let output: Arc<dyn OutputSink> = match format {
        OutputFormat::Text => Arc::new(ConsoleOutput),
        OutputFormat::Json => Arc::new(NullOutput),
    };
    let chat_id = chat_id.unwrap_or_else(|| format!("chat_{}", uuid::Uuid::new_v4()));
    let ctx = Context::new(chat_id)
        .with_output(output)
        .with_user(whoami());

    let options = Options {
        skip: Skip {
            search: no_search,
            ..Default::default()
        },
        ..Default::default()
    };

    let cancel = ctx.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = assistant
        .stream(&rt, &ctx, vec![Message::user(message)], options)
        .await;
    interrupt.abort();
    if let Err(e) = &result {
        eprintln!("hint: {}", e.user_hint());
    }
    let response = result.with_context(|| format!("Chat with '{}' failed", id))?;

    match format {
        OutputFormat::Text => {
            println!();
            if let Some(search) = &response.search {
                eprintln!("[search] {} reference(s)", search.references.len());
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    database.close().await?;
    Ok(())
}

/// Print the effective configuration
pub fn handle_config_show(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let text = toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", text);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
    }
    Ok(())
}

fn get_db_path(config: &Config) -> PathBuf {
    config
        .storage
        .sqlite
        .clone()
        .unwrap_or_else(|| config.core.data_dir.join("atrium.db"))
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string())
}
